//! Transaction validation workers.
//!
//! [`check_batch`] is the actual rule set. It is pure, so it runs the same
//! way inline ([`InlineValidator`]) or on a pool of workers
//! ([`ValidationPool`]) that splits large batches across tasks.
//!
//! Rules, per batch:
//!
//! 1. Every signature verifies.
//! 2. Every input exists in the context and is owned by the sender.
//! 3. No output is spent twice within the batch.
//! 4. Inputs cover outputs.
//! 5. At most one reward transaction, paying no more than [`BLOCK_REWARD`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{Termination, WorkerHandle, WorkerRequest};
use crate::chain::transaction::BLOCK_REWARD;
use crate::chain::{KeyBinding, Transaction, ValidationContext};
use crate::config::WORKER_QUEUE_DEPTH;
use crate::crypto::hash::short_hex;
use crate::network::sync::{TransactionValidator, ValidationError};

/// Remembered abort ids for batches that have not arrived yet.
const MAX_EARLY_ABORTS: usize = 1_024;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Check `transactions` against `context`. Returns the bindings for senders
/// not yet known to the chain.
pub fn check_batch(transactions: &[Transaction], context: &ValidationContext) -> Result<Vec<KeyBinding>, String> {
    let mut spent = HashSet::new();
    let mut rewards = 0usize;
    let mut bindings = BTreeMap::new();

    for tx in transactions {
        let id = short_hex(&tx.id());
        if !tx.verify_signature() {
            return Err(format!("transaction {id}: bad signature"));
        }
        let paid = tx
            .total_output()
            .ok_or_else(|| format!("transaction {id}: output overflow"))?;

        if tx.is_reward() {
            rewards += 1;
            if rewards > 1 {
                return Err(format!("transaction {id}: second reward in batch"));
            }
            if paid > BLOCK_REWARD {
                return Err(format!("transaction {id}: reward {paid} exceeds {BLOCK_REWARD}"));
            }
        } else {
            let sender = tx.sender_address();
            let mut funded = 0u64;
            for input in &tx.inputs {
                let Some(output) = context.utxos.get(input) else {
                    return Err(format!("transaction {id}: unknown or spent input"));
                };
                if output.address != sender {
                    return Err(format!("transaction {id}: input not owned by sender"));
                }
                if !spent.insert(*input) {
                    return Err(format!("transaction {id}: double spend within batch"));
                }
                funded = funded
                    .checked_add(output.amount)
                    .ok_or_else(|| format!("transaction {id}: input overflow"))?;
            }
            if funded < paid {
                return Err(format!("transaction {id}: spends {paid} with {funded} available"));
            }
        }

        let binding = tx.binding();
        if !context.known_bindings.contains_key(&binding.address) {
            bindings.insert(binding.address, binding);
        }
    }
    Ok(bindings.into_values().collect())
}

/// Runs [`check_batch`] on the calling task.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineValidator;

#[async_trait]
impl TransactionValidator for InlineValidator {
    async fn validate(
        &self,
        transactions: &[Transaction],
        context: ValidationContext,
    ) -> Result<Vec<KeyBinding>, ValidationError> {
        check_batch(transactions, &context).map_err(ValidationError::Rejected)
    }
}

// ---------------------------------------------------------------------------
// Worker Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ValidationRequest {
    Validate {
        batch_id: u64,
        transactions: Vec<Transaction>,
        context: ValidationContext,
    },
    Abort {
        batch_id: u64,
    },
    Terminate,
}

impl WorkerRequest for ValidationRequest {
    fn terminate() -> Self {
        Self::Terminate
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationResponse {
    Validated { batch_id: u64, bindings: Vec<KeyBinding> },
    Rejected { batch_id: u64, error: String },
    Aborted { batch_id: u64 },
}

impl ValidationResponse {
    pub fn batch_id(&self) -> u64 {
        match self {
            Self::Validated { batch_id, .. } | Self::Rejected { batch_id, .. } | Self::Aborted { batch_id } => {
                *batch_id
            }
        }
    }
}

struct Batch {
    id: u64,
    transactions: Vec<Transaction>,
    context: ValidationContext,
}

/// Queue bookkeeping for one request. Returns false on terminate.
fn absorb(
    request: ValidationRequest,
    queue: &mut VecDeque<Batch>,
    early_aborts: &mut HashSet<u64>,
    outbox: &mut Vec<ValidationResponse>,
) -> bool {
    match request {
        ValidationRequest::Validate {
            batch_id,
            transactions,
            context,
        } => {
            if early_aborts.remove(&batch_id) {
                outbox.push(ValidationResponse::Aborted { batch_id });
            } else {
                queue.push_back(Batch {
                    id: batch_id,
                    transactions,
                    context,
                });
            }
        }
        ValidationRequest::Abort { batch_id } => {
            let before = queue.len();
            queue.retain(|batch| batch.id != batch_id);
            if queue.len() < before {
                outbox.push(ValidationResponse::Aborted { batch_id });
            } else {
                if early_aborts.len() >= MAX_EARLY_ABORTS {
                    early_aborts.clear();
                }
                early_aborts.insert(batch_id);
            }
        }
        ValidationRequest::Terminate => return false,
    }
    true
}

/// Spawn one validation worker. Queued batches can be aborted until they
/// start; the checks themselves run on the blocking pool.
pub fn spawn_validation_worker(name: impl Into<String>) -> WorkerHandle<ValidationRequest, ValidationResponse> {
    WorkerHandle::spawn(name, WORKER_QUEUE_DEPTH, |mut requests, responses| async move {
        let mut queue = VecDeque::new();
        let mut early_aborts = HashSet::new();
        let mut outbox = Vec::new();
        loop {
            if queue.is_empty() {
                match requests.recv().await {
                    Some(request) => {
                        if !absorb(request, &mut queue, &mut early_aborts, &mut outbox) {
                            break;
                        }
                    }
                    None => break,
                }
            }
            while let Ok(request) = requests.try_recv() {
                if !absorb(request, &mut queue, &mut early_aborts, &mut outbox) {
                    return;
                }
            }
            for response in outbox.drain(..) {
                if responses.send(response).await.is_err() {
                    return;
                }
            }

            let Some(batch) = queue.pop_front() else {
                continue;
            };
            let batch_id = batch.id;
            let verdict =
                tokio::task::spawn_blocking(move || check_batch(&batch.transactions, &batch.context)).await;
            let response = match verdict {
                Ok(Ok(bindings)) => ValidationResponse::Validated { batch_id, bindings },
                Ok(Err(error)) => ValidationResponse::Rejected { batch_id, error },
                Err(err) => ValidationResponse::Rejected {
                    batch_id,
                    error: format!("validation task failed: {err}"),
                },
            };
            if responses.send(response).await.is_err() {
                break;
            }
        }
    })
}

// ---------------------------------------------------------------------------
// ValidationPool
// ---------------------------------------------------------------------------

type Pending = Arc<DashMap<u64, oneshot::Sender<ValidationResponse>>>;

/// Spreads a batch across N validation workers.
///
/// Properties that span the whole batch (double spends across chunks, the
/// single reward) are checked here before splitting. Each chunk then goes
/// to one worker with the slice of the context it needs. The first
/// rejection aborts the chunks still queued.
pub struct ValidationPool {
    senders: Vec<mpsc::Sender<ValidationRequest>>,
    handles: Mutex<Vec<WorkerHandle<ValidationRequest, ValidationResponse>>>,
    pending: Pending,
    next_batch: AtomicU64,
}

impl ValidationPool {
    pub fn spawn(workers: usize) -> Self {
        let pending: Pending = Arc::new(DashMap::new());
        let mut senders = Vec::new();
        let mut handles = Vec::new();
        for i in 0..workers.max(1) {
            let mut handle = spawn_validation_worker(format!("validator-{i}"));
            if let Some(mut responses) = handle.take_responses() {
                let pending = Arc::clone(&pending);
                tokio::spawn(async move {
                    while let Some(response) = responses.recv().await {
                        if let Some((_, waiter)) = pending.remove(&response.batch_id()) {
                            let _ = waiter.send(response);
                        }
                    }
                });
            }
            senders.push(handle.sender());
            handles.push(handle);
        }
        debug!(workers = senders.len(), "validation pool started");
        Self {
            senders,
            handles: Mutex::new(handles),
            pending,
            next_batch: AtomicU64::new(1),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Terminate every worker.
    pub async fn shutdown(&self, grace: Duration) -> Vec<Termination> {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.terminate(grace).await);
        }
        results
    }

    async fn dispatch(
        &self,
        worker: usize,
        transactions: Vec<Transaction>,
        context: ValidationContext,
    ) -> Result<(u64, oneshot::Receiver<ValidationResponse>), ValidationError> {
        let batch_id = self.next_batch.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(batch_id, tx);
        let request = ValidationRequest::Validate {
            batch_id,
            transactions,
            context,
        };
        if self.senders[worker].send(request).await.is_err() {
            self.pending.remove(&batch_id);
            return Err(ValidationError::Unavailable(format!("validator-{worker} stopped")));
        }
        Ok((batch_id, rx))
    }

    async fn abort(&self, outstanding: &BTreeMap<u64, usize>) {
        for (batch_id, worker) in outstanding {
            self.pending.remove(batch_id);
            let _ = self.senders[*worker]
                .send(ValidationRequest::Abort { batch_id: *batch_id })
                .await;
        }
    }
}

/// Checks that need the whole batch at once.
fn check_across_chunks(transactions: &[Transaction]) -> Result<(), String> {
    let mut spent = HashSet::new();
    let mut rewards = 0usize;
    for tx in transactions {
        if tx.is_reward() {
            rewards += 1;
        }
        for input in &tx.inputs {
            if !spent.insert(*input) {
                return Err(format!("transaction {}: double spend within batch", short_hex(&tx.id())));
            }
        }
    }
    if rewards > 1 {
        return Err(format!("{rewards} reward transactions in batch"));
    }
    Ok(())
}

#[async_trait]
impl TransactionValidator for ValidationPool {
    async fn validate(
        &self,
        transactions: &[Transaction],
        context: ValidationContext,
    ) -> Result<Vec<KeyBinding>, ValidationError> {
        if transactions.is_empty() {
            return Ok(Vec::new());
        }
        check_across_chunks(transactions).map_err(ValidationError::Rejected)?;

        let chunk_size = transactions.len().div_ceil(self.senders.len());
        let mut outstanding = BTreeMap::new();
        let mut waiting = FuturesUnordered::new();
        for (worker, chunk) in transactions.chunks(chunk_size).enumerate() {
            let slice = ValidationContext {
                utxos: chunk
                    .iter()
                    .flat_map(|tx| tx.inputs.iter())
                    .filter_map(|input| context.utxos.get(input).map(|out| (*input, out.clone())))
                    .collect(),
                known_bindings: context.known_bindings.clone(),
            };
            let (batch_id, rx) = match self.dispatch(worker, chunk.to_vec(), slice).await {
                Ok(dispatched) => dispatched,
                Err(err) => {
                    self.abort(&outstanding).await;
                    return Err(err);
                }
            };
            outstanding.insert(batch_id, worker);
            waiting.push(async move { (batch_id, rx.await) });
        }

        let mut bindings = BTreeMap::new();
        while let Some((batch_id, response)) = waiting.next().await {
            outstanding.remove(&batch_id);
            let failure = match response {
                Ok(ValidationResponse::Validated { bindings: found, .. }) => {
                    for binding in found {
                        bindings.insert(binding.address, binding);
                    }
                    continue;
                }
                Ok(ValidationResponse::Rejected { error, .. }) => ValidationError::Rejected(error),
                Ok(ValidationResponse::Aborted { .. }) => {
                    ValidationError::Unavailable(format!("batch {batch_id} aborted"))
                }
                Err(_) => ValidationError::Unavailable(format!("batch {batch_id} dropped")),
            };
            warn!(batch_id, error = %failure, "validation batch failed");
            self.abort(&outstanding).await;
            return Err(failure);
        }
        Ok(bindings.into_values().collect())
    }
}

impl std::fmt::Debug for ValidationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationPool")
            .field("workers", &self.senders.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
