//! # Workers
//!
//! CPU-bound work runs outside the node event loop, in tasks that talk to it
//! only through channels. There are two kinds:
//!
//! - [`miner`]: searches for a nonce that seals a block candidate.
//! - [`validation`]: checks batches of transactions against a UTXO context.
//!
//! Each worker kind has a closed request/response enum. Workers never touch
//! the peer store or the chain; they return results and the event loop
//! applies them.
//!
//! ## Termination
//!
//! [`WorkerHandle::terminate`] sends the worker's terminate message and waits
//! up to a grace period for the task to exit. A worker that ignores it is
//! aborted, so shutdown always completes in bounded time.

pub mod miner;
pub mod validation;

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use miner::{spawn_miner, MinerConfig, MinerRequest, MinerResponse};
pub use validation::{check_batch, InlineValidator, ValidationPool, ValidationRequest, ValidationResponse};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("worker {0} has stopped")]
    Stopped(String),

    #[error("worker {0} returned no response")]
    NoResponse(String),

    #[error("no workers configured")]
    Empty,
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own after the terminate message.
    Graceful,
    /// Aborted after the grace period, or died on its own.
    Forced,
}

/// A request type with a terminate variant.
pub trait WorkerRequest: Send + 'static {
    fn terminate() -> Self;
}

/// A spawned worker task plus its two channels.
pub struct WorkerHandle<Req, Resp> {
    name: String,
    requests: mpsc::Sender<Req>,
    responses: Option<mpsc::Receiver<Resp>>,
    task: Option<JoinHandle<()>>,
}

impl<Req: WorkerRequest, Resp: Send + 'static> WorkerHandle<Req, Resp> {
    /// Spawn `body` with the worker's ends of both channels.
    pub fn spawn<F, Fut>(name: impl Into<String>, queue_depth: usize, body: F) -> Self
    where
        F: FnOnce(mpsc::Receiver<Req>, mpsc::Sender<Resp>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (req_tx, req_rx) = mpsc::channel(queue_depth);
        let (resp_tx, resp_rx) = mpsc::channel(queue_depth);
        let task = tokio::spawn(body(req_rx, resp_tx));
        debug!(worker = %name, "worker spawned");
        Self {
            name,
            requests: req_tx,
            responses: Some(resp_rx),
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&self, request: Req) -> Result<(), WorkerError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| WorkerError::Stopped(self.name.clone()))
    }

    /// A cloneable request sender.
    pub fn sender(&self) -> mpsc::Sender<Req> {
        self.requests.clone()
    }

    /// Next response, or `None` once the worker is gone or the receiver
    /// was taken.
    pub async fn recv(&mut self) -> Option<Resp> {
        match self.responses.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Move the response receiver out, e.g. into a dispatcher task.
    pub fn take_responses(&mut self) -> Option<mpsc::Receiver<Resp>> {
        self.responses.take()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Ask the worker to stop, aborting it after `grace`.
    pub async fn terminate(mut self, grace: Duration) -> Termination {
        let Some(mut task) = self.task.take() else {
            return Termination::Graceful;
        };
        let requests = self.requests.clone();
        let stop = async {
            let _ = requests.send(Req::terminate()).await;
            (&mut task).await
        };
        let outcome = tokio::time::timeout(grace, stop).await;
        match outcome {
            Ok(Ok(())) => {
                debug!(worker = %self.name, "worker stopped");
                Termination::Graceful
            }
            Ok(Err(err)) => {
                warn!(worker = %self.name, error = %err, "worker task failed");
                Termination::Forced
            }
            Err(_) => {
                task.abort();
                warn!(worker = %self.name, grace_ms = grace.as_millis() as u64, "worker ignored terminate, aborted");
                Termination::Forced
            }
        }
    }
}

impl<Req, Resp> Drop for WorkerHandle<Req, Resp> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<Req, Resp> std::fmt::Debug for WorkerHandle<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").field("name", &self.name).finish()
    }
}
