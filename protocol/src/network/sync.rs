//! # Block Synchronization Engine
//!
//! Reconciles the local chain with what peers announce. The engine fetches
//! missing blocks, validates them and applies them in order. It also serves
//! the same requests to peers that are behind.
//!
//! ## Protocol Overview
//!
//! ```text
//! Behind                              Peer
//! ──────                             ──────
//!   │  (gossip: BlockFinalized #10)    │
//!   │<───────────────────────────────  │
//!   │  GetBlock { index: 9 }           │
//!   │───────────────────────────────>  │
//!   │  Block(Some(#9))                 │
//!   │<───────────────────────────────  │
//!   │  apply #9, then apply #10        │
//!   │                                  │
//!   │  GetBlockByHash { prev_hash }    │   (only when #n does not link:
//!   │───────────────────────────────>  │    walk back to a common ancestor)
//! ```
//!
//! Per index the engine tracks
//! `Missing -> Requested -> Received -> Validating -> Applied | Rejected`.
//!
//! ## Design Decisions
//!
//! - **Strict validation order.** Structure (hash, limits, timestamp) comes
//!   first, then `prev_hash` continuity with the head, then the transaction
//!   checks delegated to a [`TransactionValidator`], and only then the
//!   apply. A block that fails any step is discarded and the head is
//!   unchanged.
//!
//! - **Forward by index, backward by hash.** Gaps are filled by fetching
//!   `head+1 ..= target` in ascending order. A block that does not link
//!   triggers a walk back by `prev_hash` to a common ancestor, bounded by
//!   `max_backfill_depth`. Past the bound the block is dropped with
//!   [`SyncError::ForkTooDeep`].
//!
//! - **Bounded reorg.** A competing branch is adopted only when it is
//!   strictly longer. The chain is truncated to the ancestor and the branch
//!   applied through the normal pipeline. If any branch block fails, the
//!   original blocks are put back.
//!
//! - **One apply at a time.** Fetches may run concurrently from many tasks,
//!   but every mutation of the chain head goes through an async gate.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::messager::{Messager, Request, Response};
use crate::chain::{
    Address, BlockCandidate, ChainError, ChainState, FinalizedBlock, KeyBinding, Transaction,
    UtxoSet, ValidationContext,
};
use crate::config::{
    now_ms, MAX_BACKFILL_DEPTH, MAX_BLOCK_TRANSACTIONS, MAX_BUFFERED_BLOCKS, MAX_FUTURE_DRIFT,
    SYNC_BATCH_SIZE,
};
use crate::crypto::hash::{short_hex, Hash32};
use crate::crypto::keys::PeerId;
use crate::storage::{BlockStore, StoreError};

/// Per-index states older than this many blocks below the head are dropped.
const STATE_HISTORY: u64 = 256;

// ---------------------------------------------------------------------------
// Sync Request / Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRequest {
    GetChainTip,
    /// Blocks in `[start, end)`, capped at the server's batch size.
    GetBlocks { start: u64, end: u64 },
    GetBlock { index: u64 },
    GetBlockByHash { hash: Hash32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncResponse {
    ChainTip { index: u64, hash: Hash32 },
    /// Ascending by index.
    Blocks(Vec<FinalizedBlock>),
    Block(Option<FinalizedBlock>),
    Error(String),
}

/// Answer `request` from `chain`.
pub fn serve(chain: &ChainState, request: SyncRequest, batch_size: u64) -> SyncResponse {
    match request {
        SyncRequest::GetChainTip => SyncResponse::ChainTip {
            index: chain.height(),
            hash: chain.head().hash,
        },
        SyncRequest::GetBlocks { start, end } => {
            if start >= end {
                return SyncResponse::Blocks(Vec::new());
            }
            let last = (end - 1).min(start.saturating_add(batch_size.max(1) - 1));
            SyncResponse::Blocks(chain.range(start, last))
        }
        SyncRequest::GetBlock { index } => SyncResponse::Block(chain.get(index).cloned()),
        SyncRequest::GetBlockByHash { hash } => SyncResponse::Block(chain.get_by_hash(&hash).cloned()),
    }
}

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum ancestors fetched while looking for a fork point.
    pub max_backfill_depth: u64,
    /// Largest `GetBlocks` range we serve.
    pub batch_size: u64,
    pub max_future_drift_ms: u64,
    /// Out-of-order gossip blocks held while their gap is filled.
    pub max_buffered: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_backfill_depth: MAX_BACKFILL_DEPTH,
            batch_size: SYNC_BATCH_SIZE,
            max_future_drift_ms: MAX_FUTURE_DRIFT.as_millis() as u64,
            max_buffered: MAX_BUFFERED_BLOCKS,
        }
    }
}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

/// Errors that can occur during block synchronization.
///
/// `InvalidBlock`, `BrokenLink`, `ForkTooDeep` and `Validation` mean the data
/// is wrong and the block is discarded. `Fetch`, `NoPeers` and `Storage`
/// are infrastructure failures worth retrying later.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid block {index}: {reason}")]
    InvalidBlock { index: u64, reason: String },

    #[error("block {index} does not link to the local chain")]
    BrokenLink { index: u64 },

    #[error("fork below block {index} is deeper than {depth} blocks")]
    ForkTooDeep { index: u64, depth: u64 },

    #[error("block {index} failed transaction validation: {reason}")]
    Validation { index: u64, reason: String },

    #[error("fetch from {peer} failed: {reason}")]
    Fetch { peer: PeerId, reason: String },

    #[error("no peer to fetch from")]
    NoPeers,

    #[error("storage: {0}")]
    Storage(#[from] StoreError),

    #[error("chain: {0}")]
    Chain(#[from] ChainError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0}")]
    Rejected(String),

    #[error("validator unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Where missing blocks come from.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn fetch(&self, peer: &PeerId, request: SyncRequest) -> Result<SyncResponse, SyncError>;
}

#[async_trait]
impl BlockSource for Messager {
    async fn fetch(&self, peer: &PeerId, request: SyncRequest) -> Result<SyncResponse, SyncError> {
        match self.request(peer, Request::Sync(request)).await {
            Ok(Response::Sync(response)) => Ok(response),
            Ok(other) => Err(SyncError::Fetch {
                peer: peer.clone(),
                reason: format!("unexpected response {other:?}"),
            }),
            Err(err) => Err(SyncError::Fetch {
                peer: peer.clone(),
                reason: err.to_string(),
            }),
        }
    }
}

/// Transaction-level checks for a block. Returns the key bindings the
/// transactions reveal.
#[async_trait]
pub trait TransactionValidator: Send + Sync {
    async fn validate(
        &self,
        transactions: &[Transaction],
        context: ValidationContext,
    ) -> Result<Vec<KeyBinding>, ValidationError>;
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    Missing,
    Requested,
    Received,
    Validating,
    Applied,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// First candidate for its slot.
    Accepted,
    /// Same `(index, prev_hash, proposer)` as the one held.
    Duplicate,
    /// Replaced the held candidate from another proposer.
    Superseded,
    /// Does not build on the current head.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub applied: u64,
    pub rejected: u64,
    pub reorgs: u64,
    pub fetch_failures: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    rejected: AtomicU64,
    reorgs: AtomicU64,
    fetch_failures: AtomicU64,
}

struct Ledger {
    chain: ChainState,
    utxos: UtxoSet,
}

enum Placement {
    Known,
    ExtendsHead,
    Detached,
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

/// The block synchronization engine.
///
/// ## Thread Safety
///
/// The ledger sits behind a `RwLock` that is never held across an await.
/// Reads (`process_sync_request`, snapshots) run concurrently with fetches.
/// Writes happen only inside `apply_gate`.
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn BlockStore>,
    source: Arc<dyn BlockSource>,
    validator: Arc<dyn TransactionValidator>,
    ledger: RwLock<Ledger>,
    apply_gate: tokio::sync::Mutex<()>,
    states: Mutex<BTreeMap<u64, BlockState>>,
    buffered: Mutex<BTreeMap<u64, FinalizedBlock>>,
    candidates: Mutex<HashMap<(u64, Hash32), BlockCandidate>>,
    applied_tx: broadcast::Sender<FinalizedBlock>,
    counters: Counters,
}

impl SyncEngine {
    /// Load the chain from `store`, seeding an empty store with genesis.
    pub fn open(
        config: SyncConfig,
        store: Arc<dyn BlockStore>,
        source: Arc<dyn BlockSource>,
        validator: Arc<dyn TransactionValidator>,
    ) -> Result<Self, SyncError> {
        let mut blocks = store.load_all()?;
        if blocks.is_empty() {
            let genesis = FinalizedBlock::genesis();
            store.put_block(&genesis)?;
            blocks.push(genesis);
        }
        for block in &blocks {
            block.verify().map_err(|e| SyncError::InvalidBlock {
                index: block.index,
                reason: e.to_string(),
            })?;
        }
        let chain = ChainState::from_blocks(blocks)?;
        if store.latest_index()? > Some(chain.height()) {
            warn!(height = chain.height(), "dropping stored blocks past a gap");
            store.truncate(chain.height())?;
        }
        let utxos = UtxoSet::rebuild(chain.blocks());
        info!(height = chain.height(), head = %chain.head().short_hash(), "chain loaded");

        let (applied_tx, _) = broadcast::channel(256);
        Ok(Self {
            config,
            store,
            source,
            validator,
            ledger: RwLock::new(Ledger { chain, utxos }),
            apply_gate: tokio::sync::Mutex::new(()),
            states: Mutex::new(BTreeMap::new()),
            buffered: Mutex::new(BTreeMap::new()),
            candidates: Mutex::new(HashMap::new()),
            applied_tx,
            counters: Counters::default(),
        })
    }

    // -- Inbound hints ------------------------------------------------------

    /// A peer says its chain reaches `index`. Fetch `head+1 ..= index` in
    /// order, trying `fallbacks` when `peer` cannot serve a block. Returns
    /// the number of blocks applied.
    pub async fn on_announcement(&self, peer: &PeerId, index: u64, fallbacks: &[PeerId]) -> Result<usize, SyncError> {
        let height = self.height();
        if index <= height {
            return Ok(0);
        }
        {
            // Peers pick `index`; only the window ahead of head is tracked.
            let last = index.min(self.tracking_limit(height));
            let mut states = self.states.lock();
            for missing in height + 1..=last {
                states.entry(missing).or_insert(BlockState::Missing);
            }
        }
        debug!(peer = %peer.short(), from = height + 1, to = index, "catching up");
        self.catch_up(peer, index, fallbacks).await
    }

    /// A full block arrived by gossip.
    pub async fn on_block(&self, peer: &PeerId, block: FinalizedBlock, fallbacks: &[PeerId]) -> Result<usize, SyncError> {
        self.check_structure(&block)?;
        if block.index > self.height() + 1 {
            let target = block.index;
            self.buffer(block);
            return self.catch_up(peer, target, fallbacks).await;
        }
        self.ingest(peer, block, fallbacks).await
    }

    /// A block produced by the local miner.
    pub async fn apply_local(&self, block: FinalizedBlock) -> Result<(), SyncError> {
        self.check_structure(&block)?;
        let _gate = self.apply_gate.lock().await;
        self.apply_one(block).await
    }

    /// Track a mining candidate. Candidates compete per `(index, prev_hash)`
    /// and are deduplicated by proposer within a slot.
    pub fn offer_candidate(&self, candidate: BlockCandidate) -> Result<CandidateOutcome, SyncError> {
        if candidate.transactions.len() > MAX_BLOCK_TRANSACTIONS {
            return Err(SyncError::InvalidBlock {
                index: candidate.index,
                reason: format!("{} transactions", candidate.transactions.len()),
            });
        }
        let (height, head) = self.tip();
        if candidate.index != height + 1 || candidate.prev_hash != head {
            return Ok(CandidateOutcome::Stale);
        }

        let mut pool = self.candidates.lock();
        pool.retain(|(index, _), _| *index > height);
        let slot = candidate.slot();
        let outcome = match pool.get(&slot) {
            None => CandidateOutcome::Accepted,
            Some(held) if held.proposer == candidate.proposer => return Ok(CandidateOutcome::Duplicate),
            Some(_) => CandidateOutcome::Superseded,
        };
        debug!(index = candidate.index, proposer = %candidate.proposer.short(), ?outcome, "candidate tracked");
        pool.insert(slot, candidate);
        Ok(outcome)
    }

    /// The candidate currently held for the next index, if any.
    pub fn candidate(&self) -> Option<BlockCandidate> {
        let (height, head) = self.tip();
        self.candidates.lock().get(&(height + 1, head)).cloned()
    }

    /// Serving side of the sync protocol. Pure reads.
    pub fn process_sync_request(&self, request: SyncRequest) -> SyncResponse {
        serve(&self.ledger.read().chain, request, self.config.batch_size)
    }

    // -- Pipeline -----------------------------------------------------------

    async fn catch_up(&self, peer: &PeerId, target: u64, fallbacks: &[PeerId]) -> Result<usize, SyncError> {
        let mut applied = 0;
        loop {
            let height = self.height();
            let next = height + 1;
            if next > target {
                break;
            }
            let block = match self.take_buffered(next) {
                Some(block) => block,
                None => {
                    self.fetch_block(
                        next,
                        SyncRequest::GetBlock { index: next },
                        move |b| b.index == next,
                        peer,
                        fallbacks,
                    )
                    .await?
                }
            };
            applied += self.ingest(peer, block, fallbacks).await?;
            if self.height() <= height {
                // The block was stale or lost a race; nothing more to chase.
                break;
            }
        }
        Ok(applied)
    }

    async fn ingest(&self, peer: &PeerId, block: FinalizedBlock, fallbacks: &[PeerId]) -> Result<usize, SyncError> {
        self.check_structure(&block)?;
        {
            let _gate = self.apply_gate.lock().await;
            match self.placement(&block) {
                Placement::Known => return Ok(0),
                Placement::ExtendsHead => {
                    self.apply_one(block).await?;
                    return Ok(1);
                }
                Placement::Detached if block.index <= self.height() => {
                    // A sibling at or below our height can never be the longer branch.
                    debug!(index = block.index, hash = %block.short_hash(), "stale fork block ignored");
                    return Ok(0);
                }
                Placement::Detached => {}
            }
        }

        let branch = self.backfill(peer, block, fallbacks).await?;
        let _gate = self.apply_gate.lock().await;
        self.adopt_branch(branch).await
    }

    fn placement(&self, block: &FinalizedBlock) -> Placement {
        let ledger = self.ledger.read();
        if ledger.chain.contains_hash(&block.hash) {
            Placement::Known
        } else if ledger.chain.extends_head(block) {
            Placement::ExtendsHead
        } else {
            Placement::Detached
        }
    }

    /// Walk back from `tip` by `prev_hash` until a block links into the
    /// local chain. Returns the branch in ascending order.
    async fn backfill(&self, peer: &PeerId, tip: FinalizedBlock, fallbacks: &[PeerId]) -> Result<Vec<FinalizedBlock>, SyncError> {
        let tip_index = tip.index;
        let mut branch = vec![tip];
        loop {
            let (prev_hash, child_index) = match branch.last() {
                Some(oldest) => (oldest.prev_hash, oldest.index),
                None => break,
            };
            if self.ledger.read().chain.contains_hash(&prev_hash) {
                break;
            }
            let fetched = (branch.len() - 1) as u64;
            if fetched >= self.config.max_backfill_depth || child_index <= 1 {
                let err = SyncError::ForkTooDeep {
                    index: tip_index,
                    depth: self.config.max_backfill_depth,
                };
                return Err(self.reject(tip_index, err));
            }
            let parent_index = child_index - 1;
            let parent = self
                .fetch_block(
                    parent_index,
                    SyncRequest::GetBlockByHash { hash: prev_hash },
                    move |b| b.hash == prev_hash && b.index == parent_index,
                    peer,
                    fallbacks,
                )
                .await?;
            self.check_structure(&parent)?;
            branch.push(parent);
        }
        branch.reverse();
        Ok(branch)
    }

    /// Apply a branch whose first block links into the chain. Caller holds
    /// the apply gate.
    async fn adopt_branch(&self, branch: Vec<FinalizedBlock>) -> Result<usize, SyncError> {
        let (fresh, ancestor, height) = {
            let ledger = self.ledger.read();
            let fresh: Vec<FinalizedBlock> = branch
                .into_iter()
                .skip_while(|b| ledger.chain.contains_hash(&b.hash))
                .collect();
            let Some(first) = fresh.first() else {
                return Ok(0);
            };
            let Some(ancestor) = ledger.chain.get_by_hash(&first.prev_hash).map(|b| b.index) else {
                // The chain moved while we were fetching.
                return Err(SyncError::BrokenLink { index: first.index });
            };
            (fresh, ancestor, ledger.chain.height())
        };
        let tip = fresh.last().map_or(ancestor, |b| b.index);

        if ancestor == height {
            let count = fresh.len();
            for block in fresh {
                self.apply_one(block).await?;
            }
            return Ok(count);
        }
        if tip <= height {
            debug!(ancestor, tip, height, "competing branch is not longer, ignored");
            return Ok(0);
        }
        self.reorg(ancestor, fresh).await
    }

    async fn reorg(&self, ancestor: u64, branch: Vec<FinalizedBlock>) -> Result<usize, SyncError> {
        let height = self.height();
        let tip = branch.last().map_or(ancestor, |b| b.index);
        warn!(ancestor, from = height, to = tip, "reorganizing chain");

        let removed = self.rewind(ancestor)?;
        let count = branch.len();
        for block in branch {
            if let Err(err) = self.apply_one(block).await {
                warn!(error = %err, "fork branch failed, restoring previous chain");
                self.rewind(ancestor)?;
                self.restore(removed)?;
                return Err(err);
            }
        }
        self.counters.reorgs.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    fn rewind(&self, ancestor: u64) -> Result<Vec<FinalizedBlock>, SyncError> {
        self.store.truncate(ancestor)?;
        let removed = {
            let mut ledger = self.ledger.write();
            let removed = ledger.chain.truncate(ancestor);
            let rebuilt = UtxoSet::rebuild(ledger.chain.blocks());
            ledger.utxos = rebuilt;
            removed
        };
        let mut states = self.states.lock();
        for block in &removed {
            states.remove(&block.index);
        }
        Ok(removed)
    }

    /// Put back blocks that were valid before a failed reorg.
    fn restore(&self, blocks: Vec<FinalizedBlock>) -> Result<(), SyncError> {
        for block in blocks {
            self.store.put_block(&block)?;
            let index = block.index;
            {
                let mut ledger = self.ledger.write();
                ledger.utxos.apply_block(&block);
                ledger.chain.append(block)?;
            }
            self.mark(index, BlockState::Applied);
        }
        Ok(())
    }

    /// Continuity, transaction validation, persistence, apply. Caller
    /// holds the apply gate.
    async fn apply_one(&self, block: FinalizedBlock) -> Result<(), SyncError> {
        let index = block.index;
        self.mark(index, BlockState::Validating);

        let context = {
            let ledger = self.ledger.read();
            if !ledger.chain.extends_head(&block) {
                return Err(self.reject(index, SyncError::BrokenLink { index }));
            }
            ledger.utxos.context_for(&block)
        };

        let bindings = match self.validator.validate(&block.transactions, context).await {
            Ok(bindings) => bindings,
            Err(err) => {
                let err = SyncError::Validation {
                    index,
                    reason: err.to_string(),
                };
                return Err(self.reject(index, err));
            }
        };

        self.store.put_block(&block)?;
        {
            let mut ledger = self.ledger.write();
            ledger.chain.append(block.clone())?;
            ledger.utxos.apply_block(&block);
            ledger.utxos.record_bindings(&bindings);
        }
        self.mark(index, BlockState::Applied);
        self.buffered.lock().retain(|buffered, _| *buffered > index);
        self.counters.applied.fetch_add(1, Ordering::Relaxed);

        info!(
            index,
            hash = %block.short_hash(),
            txs = block.transactions.len(),
            "block applied"
        );
        let _ = self.applied_tx.send(block);
        Ok(())
    }

    fn check_structure(&self, block: &FinalizedBlock) -> Result<(), SyncError> {
        let verdict = block
            .verify()
            .map_err(|e| e.to_string())
            .and_then(|()| {
                let limit = now_ms().saturating_add(self.config.max_future_drift_ms);
                if block.timestamp > limit {
                    Err(format!("timestamp {} is too far in the future", block.timestamp))
                } else {
                    Ok(())
                }
            });
        verdict.map_err(|reason| {
            self.reject(
                block.index,
                SyncError::InvalidBlock {
                    index: block.index,
                    reason,
                },
            )
        })
    }

    async fn fetch_block(
        &self,
        index: u64,
        request: SyncRequest,
        accept: impl Fn(&FinalizedBlock) -> bool + Send + Sync,
        peer: &PeerId,
        fallbacks: &[PeerId],
    ) -> Result<FinalizedBlock, SyncError> {
        self.mark(index, BlockState::Requested);
        let mut last_err = SyncError::NoPeers;
        let candidates = std::iter::once(peer).chain(fallbacks.iter().filter(|p| *p != peer));
        for candidate in candidates {
            match self.source.fetch(candidate, request.clone()).await {
                Ok(SyncResponse::Block(Some(block))) if accept(&block) => {
                    self.mark(index, BlockState::Received);
                    return Ok(block);
                }
                Ok(other) => {
                    let reason = match other {
                        SyncResponse::Block(None) => "block not available".to_string(),
                        SyncResponse::Error(message) => message,
                        _ => "response does not match the request".to_string(),
                    };
                    last_err = SyncError::Fetch {
                        peer: candidate.clone(),
                        reason,
                    };
                }
                Err(err) => last_err = err,
            }
            self.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %candidate.short(), index, error = %last_err, "fetch failed");
        }
        self.mark(index, BlockState::Missing);
        Err(last_err)
    }

    fn buffer(&self, block: FinalizedBlock) {
        let index = block.index;
        let mut buffered = self.buffered.lock();
        if !buffered.contains_key(&index) && buffered.len() >= self.config.max_buffered {
            buffered.pop_last();
        }
        buffered.insert(index, block);
        drop(buffered);
        self.mark(index, BlockState::Received);
    }

    fn take_buffered(&self, index: u64) -> Option<FinalizedBlock> {
        self.buffered.lock().remove(&index)
    }

    fn mark(&self, index: u64, state: BlockState) {
        let height = self.height();
        if index > self.tracking_limit(height) {
            return;
        }
        let mut states = self.states.lock();
        if state == BlockState::Rejected && states.get(&index) == Some(&BlockState::Applied) {
            return;
        }
        states.insert(index, state);
        let floor = height.saturating_sub(STATE_HISTORY);
        states.retain(|i, _| *i >= floor);
    }

    /// Highest index whose state is tracked while the chain is at `height`.
    fn tracking_limit(&self, height: u64) -> u64 {
        height.saturating_add(self.config.max_buffered as u64)
    }

    fn reject(&self, index: u64, err: SyncError) -> SyncError {
        self.mark(index, BlockState::Rejected);
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(index, error = %err, "block rejected");
        err
    }

    // -- Snapshots ----------------------------------------------------------

    pub fn height(&self) -> u64 {
        self.ledger.read().chain.height()
    }

    /// Head index and hash.
    pub fn tip(&self) -> (u64, Hash32) {
        let ledger = self.ledger.read();
        (ledger.chain.height(), ledger.chain.head().hash)
    }

    pub fn head(&self) -> FinalizedBlock {
        self.ledger.read().chain.head().clone()
    }

    pub fn block(&self, index: u64) -> Option<FinalizedBlock> {
        self.ledger.read().chain.get(index).cloned()
    }

    pub fn block_by_hash(&self, hash: &Hash32) -> Option<FinalizedBlock> {
        self.ledger.read().chain.get_by_hash(hash).cloned()
    }

    pub fn block_states(&self) -> BTreeMap<u64, BlockState> {
        self.states.lock().clone()
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.ledger.read().utxos.balance(address)
    }

    /// Validation context for transactions not yet in a block.
    pub fn context_for(&self, transactions: &[Transaction]) -> ValidationContext {
        let probe = FinalizedBlock {
            transactions: transactions.to_vec(),
            ..self.head()
        };
        self.ledger.read().utxos.context_for(&probe)
    }

    /// Every block applied from now on, reorg branches included.
    pub fn subscribe_applied(&self) -> broadcast::Receiver<FinalizedBlock> {
        self.applied_tx.subscribe()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            reorgs: self.counters.reorgs.load(Ordering::Relaxed),
            fetch_failures: self.counters.fetch_failures.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (height, head) = self.tip();
        f.debug_struct("SyncEngine")
            .field("height", &height)
            .field("head", &short_hex(&head))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::state::tests::child;
    use crate::chain::{address_of, OutPoint, TxOutput};
    use crate::crypto::keys::NodeKeypair;
    use crate::network::peer_store::tests::peer;
    use crate::storage::MemoryBlockStore;
    use crate::workers::validation::InlineValidator;

    /// Serves fixed chains per peer and logs every request.
    #[derive(Default)]
    struct Remote {
        chains: Mutex<HashMap<PeerId, ChainState>>,
        log: Mutex<Vec<(PeerId, SyncRequest)>>,
    }

    impl Remote {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn serve_chain(&self, peer: PeerId, chain: ChainState) {
            self.chains.lock().insert(peer, chain);
        }

        fn requests(&self) -> Vec<SyncRequest> {
            self.log.lock().iter().map(|(_, r)| r.clone()).collect()
        }
    }

    #[async_trait]
    impl BlockSource for Remote {
        async fn fetch(&self, peer: &PeerId, request: SyncRequest) -> Result<SyncResponse, SyncError> {
            self.log.lock().push((peer.clone(), request.clone()));
            match self.chains.lock().get(peer) {
                Some(chain) => Ok(serve(chain, request, SYNC_BATCH_SIZE)),
                None => Err(SyncError::Fetch {
                    peer: peer.clone(),
                    reason: "unreachable".into(),
                }),
            }
        }
    }

    fn chain_of(kp: &NodeKeypair, length: u64, salt: u64) -> ChainState {
        let mut chain = ChainState::new();
        extend(&mut chain, kp, length, salt);
        chain
    }

    fn extend(chain: &mut ChainState, kp: &NodeKeypair, count: u64, salt: u64) {
        for _ in 0..count {
            let next = child(chain.head(), kp, salt);
            chain.append(next).unwrap();
        }
    }

    fn engine(remote: &Arc<Remote>, config: SyncConfig) -> SyncEngine {
        SyncEngine::open(
            config,
            Arc::new(MemoryBlockStore::new()),
            remote.clone(),
            Arc::new(InlineValidator),
        )
        .unwrap()
    }

    async fn preload(engine: &SyncEngine, chain: &ChainState, upto: u64) {
        for block in chain.range(1, upto) {
            engine.apply_local(block).await.unwrap();
        }
    }

    /// Block spending an output that does not exist.
    fn invalid_child(parent: &FinalizedBlock, kp: &NodeKeypair) -> FinalizedBlock {
        let tx = Transaction::new_signed(
            kp,
            vec![OutPoint {
                tx_id: [9; 32],
                output: 0,
            }],
            vec![TxOutput {
                address: address_of(&kp.public_key_bytes()),
                amount: 1,
            }],
            1,
        );
        BlockCandidate {
            index: parent.index + 1,
            prev_hash: parent.hash,
            timestamp: parent.timestamp + 1_000,
            proposer: kp.peer_id(),
            transactions: vec![tx],
            nonce: 0,
            difficulty: 0,
        }
        .seal(7)
    }

    // -- 1. catching up ----------------------------------------------------

    #[tokio::test]
    async fn announcement_fetches_missing_blocks_in_order() {
        let kp = NodeKeypair::generate();
        let remote_chain = chain_of(&kp, 10, 0);
        let remote = Remote::new();
        remote.serve_chain(peer(1), remote_chain.clone());
        let engine = engine(&remote, SyncConfig::default());
        preload(&engine, &remote_chain, 8).await;

        let applied = engine.on_announcement(&peer(1), 10, &[]).await.unwrap();

        assert_eq!(applied, 2);
        assert_eq!(
            remote.requests(),
            vec![SyncRequest::GetBlock { index: 9 }, SyncRequest::GetBlock { index: 10 }]
        );
        assert_eq!(engine.tip(), (10, remote_chain.head().hash));
        assert_eq!(engine.block_states().get(&10), Some(&BlockState::Applied));
    }

    #[tokio::test]
    async fn announcement_at_or_below_head_is_ignored() {
        let remote = Remote::new();
        let engine = engine(&remote, SyncConfig::default());
        assert_eq!(engine.on_announcement(&peer(1), 0, &[]).await.unwrap(), 0);
        assert!(remote.requests().is_empty());
    }

    #[tokio::test]
    async fn far_announcement_tracks_only_a_window() {
        let remote = Remote::new();
        let engine = engine(&remote, SyncConfig::default());

        let result = engine.on_announcement(&peer(1), u64::MAX, &[]).await;

        assert!(result.is_err());
        assert_eq!(engine.height(), 0);
        let states = engine.block_states();
        assert!(states.len() <= MAX_BUFFERED_BLOCKS + 1);
        assert!(states.keys().all(|i| *i <= MAX_BUFFERED_BLOCKS as u64));
        assert_eq!(remote.requests(), vec![SyncRequest::GetBlock { index: 1 }]);
    }

    #[tokio::test]
    async fn regossiped_block_keeps_its_neighbors_buffered() {
        let kp = NodeKeypair::generate();
        let remote_chain = chain_of(&kp, 7, 0);
        let remote = Remote::new();
        let engine = engine(
            &remote,
            SyncConfig {
                max_buffered: 2,
                ..SyncConfig::default()
            },
        );

        for index in [5, 7, 5] {
            let block = remote_chain.get(index).cloned().unwrap();
            assert!(engine.on_block(&peer(1), block, &[]).await.is_err());
        }

        let held: Vec<u64> = engine.buffered.lock().keys().copied().collect();
        assert_eq!(held, vec![5, 7]);
    }

    #[tokio::test]
    async fn gossip_block_beyond_head_backfills_gap() {
        let kp = NodeKeypair::generate();
        let remote_chain = chain_of(&kp, 10, 0);
        let remote = Remote::new();
        remote.serve_chain(peer(1), remote_chain.clone());
        let engine = engine(&remote, SyncConfig::default());
        preload(&engine, &remote_chain, 8).await;

        let tip = remote_chain.get(10).cloned().unwrap();
        assert_eq!(engine.on_block(&peer(1), tip, &[]).await.unwrap(), 2);
        assert_eq!(remote.requests(), vec![SyncRequest::GetBlock { index: 9 }]);
        assert_eq!(engine.height(), 10);
    }

    #[tokio::test]
    async fn fallback_peer_serves_when_announcer_cannot() {
        let kp = NodeKeypair::generate();
        let remote_chain = chain_of(&kp, 3, 0);
        let remote = Remote::new();
        remote.serve_chain(peer(2), remote_chain.clone());
        let engine = engine(&remote, SyncConfig::default());

        let applied = engine.on_announcement(&peer(1), 3, &[peer(2)]).await.unwrap();
        assert_eq!(applied, 3);
        assert_eq!(engine.stats().fetch_failures, 3);
    }

    // -- 2. continuity -----------------------------------------------------

    #[tokio::test]
    async fn block_that_does_not_link_leaves_head_unchanged() {
        let kp = NodeKeypair::generate();
        let remote = Remote::new();
        let engine = engine(&remote, SyncConfig::default());
        let before = engine.tip();

        let orphan = BlockCandidate {
            index: 1,
            prev_hash: [7; 32],
            timestamp: 1_000,
            proposer: kp.peer_id(),
            transactions: Vec::new(),
            nonce: 0,
            difficulty: 0,
        }
        .seal(0);

        assert!(matches!(
            engine.apply_local(orphan.clone()).await,
            Err(SyncError::BrokenLink { index: 1 })
        ));
        assert!(engine.on_block(&peer(1), orphan, &[]).await.is_err());
        assert_eq!(engine.tip(), before);
    }

    #[tokio::test]
    async fn tampered_block_is_rejected_structurally() {
        let kp = NodeKeypair::generate();
        let remote = Remote::new();
        let engine = engine(&remote, SyncConfig::default());
        let mut block = child(&engine.head(), &kp, 0);
        block.nonce += 1;

        assert!(matches!(
            engine.on_block(&peer(1), block, &[]).await,
            Err(SyncError::InvalidBlock { index: 1, .. })
        ));
        assert_eq!(engine.block_states().get(&1), Some(&BlockState::Rejected));
        assert_eq!(engine.height(), 0);
    }

    // -- 3. forks ----------------------------------------------------------

    #[tokio::test]
    async fn longer_fork_triggers_reorg() {
        let kp = NodeKeypair::generate();
        let local_chain = chain_of(&kp, 5, 0);
        let mut fork = ChainState::from_blocks(local_chain.range(0, 2)).unwrap();
        extend(&mut fork, &kp, 5, 1);

        let remote = Remote::new();
        remote.serve_chain(peer(1), fork.clone());
        let engine = engine(&remote, SyncConfig::default());
        preload(&engine, &local_chain, 5).await;

        engine.on_announcement(&peer(1), 7, &[]).await.unwrap();

        assert_eq!(engine.tip(), (7, fork.head().hash));
        assert_eq!(engine.block(3), fork.get(3).cloned());
        assert_eq!(engine.stats().reorgs, 1);
    }

    #[tokio::test]
    async fn fork_deeper_than_limit_is_discarded() {
        let kp = NodeKeypair::generate();
        let local_chain = chain_of(&kp, 5, 0);
        let mut fork = ChainState::from_blocks(local_chain.range(0, 2)).unwrap();
        extend(&mut fork, &kp, 5, 1);

        let remote = Remote::new();
        remote.serve_chain(peer(1), fork);
        let config = SyncConfig {
            max_backfill_depth: 2,
            ..SyncConfig::default()
        };
        let engine = engine(&remote, config);
        preload(&engine, &local_chain, 5).await;

        let err = engine.on_announcement(&peer(1), 7, &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::ForkTooDeep { index: 6, depth: 2 }));
        assert_eq!(engine.tip(), (5, local_chain.head().hash));
    }

    #[tokio::test]
    async fn failed_reorg_restores_original_chain() {
        let kp = NodeKeypair::generate();
        let local_chain = chain_of(&kp, 5, 0);
        let mut fork = ChainState::from_blocks(local_chain.range(0, 2)).unwrap();
        extend(&mut fork, &kp, 2, 1);
        let bad = invalid_child(fork.head(), &kp);
        fork.append(bad).unwrap();
        extend(&mut fork, &kp, 2, 1);

        let remote = Remote::new();
        remote.serve_chain(peer(1), fork);
        let engine = engine(&remote, SyncConfig::default());
        preload(&engine, &local_chain, 5).await;

        let err = engine.on_announcement(&peer(1), 7, &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation { index: 5, .. }));
        assert_eq!(engine.tip(), (5, local_chain.head().hash));
        assert_eq!(engine.block(3), local_chain.get(3).cloned());
        assert_eq!(engine.stats().reorgs, 0);
    }

    #[tokio::test]
    async fn shorter_fork_is_ignored() {
        let kp = NodeKeypair::generate();
        let local_chain = chain_of(&kp, 5, 0);
        let mut fork = ChainState::from_blocks(local_chain.range(0, 2)).unwrap();
        extend(&mut fork, &kp, 2, 1);

        let remote = Remote::new();
        let engine = engine(&remote, SyncConfig::default());
        preload(&engine, &local_chain, 5).await;

        let sibling = fork.get(4).cloned().unwrap();
        assert_eq!(engine.on_block(&peer(1), sibling, &[]).await.unwrap(), 0);
        assert_eq!(engine.tip(), (5, local_chain.head().hash));
        assert!(remote.requests().is_empty());
    }

    // -- 4. candidates -----------------------------------------------------

    #[tokio::test]
    async fn candidates_deduplicate_by_slot_and_proposer() {
        let kp = NodeKeypair::generate();
        let other = NodeKeypair::generate();
        let local_chain = chain_of(&kp, 4, 0);
        let remote = Remote::new();
        let engine = engine(&remote, SyncConfig::default());
        preload(&engine, &local_chain, 4).await;

        let candidate = |proposer: &NodeKeypair, nonce: u64| BlockCandidate {
            index: 5,
            prev_hash: local_chain.head().hash,
            timestamp: 9_000,
            proposer: proposer.peer_id(),
            transactions: Vec::new(),
            nonce,
            difficulty: 8,
        };

        assert_eq!(engine.offer_candidate(candidate(&kp, 1)).unwrap(), CandidateOutcome::Accepted);
        assert_eq!(engine.offer_candidate(candidate(&kp, 2)).unwrap(), CandidateOutcome::Duplicate);
        assert_eq!(engine.candidate().map(|c| c.nonce), Some(1));

        assert_eq!(
            engine.offer_candidate(candidate(&other, 3)).unwrap(),
            CandidateOutcome::Superseded
        );
        assert_eq!(engine.candidate().map(|c| c.proposer), Some(other.peer_id()));

        let mut stale = candidate(&kp, 4);
        stale.prev_hash = [1; 32];
        assert_eq!(engine.offer_candidate(stale).unwrap(), CandidateOutcome::Stale);
    }

    // -- 5. serving and startup ---------------------------------------------

    #[tokio::test]
    async fn serves_sync_requests() {
        let kp = NodeKeypair::generate();
        let local_chain = chain_of(&kp, 6, 0);
        let remote = Remote::new();
        let engine = engine(&remote, SyncConfig::default());
        preload(&engine, &local_chain, 6).await;

        assert_eq!(
            engine.process_sync_request(SyncRequest::GetChainTip),
            SyncResponse::ChainTip {
                index: 6,
                hash: local_chain.head().hash
            }
        );
        assert_eq!(
            engine.process_sync_request(SyncRequest::GetBlocks { start: 2, end: 5 }),
            SyncResponse::Blocks(local_chain.range(2, 4))
        );
        assert_eq!(
            engine.process_sync_request(SyncRequest::GetBlocks { start: 5, end: 5 }),
            SyncResponse::Blocks(Vec::new())
        );
        let b3 = local_chain.get(3).cloned();
        assert_eq!(
            engine.process_sync_request(SyncRequest::GetBlockByHash {
                hash: b3.as_ref().unwrap().hash
            }),
            SyncResponse::Block(b3)
        );
        assert_eq!(
            engine.process_sync_request(SyncRequest::GetBlock { index: 99 }),
            SyncResponse::Block(None)
        );
    }

    #[tokio::test]
    async fn startup_seeds_genesis_and_reloads() {
        let kp = NodeKeypair::generate();
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let remote = Remote::new();

        let first = SyncEngine::open(
            SyncConfig::default(),
            Arc::clone(&store),
            remote.clone(),
            Arc::new(InlineValidator),
        )
        .unwrap();
        assert_eq!(store.latest_index().unwrap(), Some(0));
        let b1 = child(&first.head(), &kp, 0);
        first.apply_local(b1.clone()).await.unwrap();
        drop(first);

        let reopened = SyncEngine::open(
            SyncConfig::default(),
            store,
            remote.clone(),
            Arc::new(InlineValidator),
        )
        .unwrap();
        assert_eq!(reopened.head(), b1);
    }

    #[tokio::test]
    async fn applied_blocks_update_utxos_and_notify() {
        let kp = NodeKeypair::generate();
        let remote = Remote::new();
        let engine = engine(&remote, SyncConfig::default());
        let mut applied = engine.subscribe_applied();

        let address = address_of(&kp.public_key_bytes());
        let genesis = engine.head();
        let block = BlockCandidate {
            index: 1,
            prev_hash: genesis.hash,
            timestamp: 1_000,
            proposer: kp.peer_id(),
            transactions: vec![Transaction::reward(&kp, address, 50, 1_000)],
            nonce: 0,
            difficulty: 0,
        }
        .seal(0);
        engine.apply_local(block.clone()).await.unwrap();

        assert_eq!(engine.balance(&address), 50);
        assert_eq!(applied.recv().await.unwrap(), block);
    }
}
