//! Mining worker.
//!
//! The node hands the miner block candidates and receives sealed blocks.
//! The search itself is a plain nonce scan against
//! [`meets_difficulty`]: the worker tries [`MINING_SLICE`] nonces, then
//! checks its queue, so pause, new work and terminate are picked up
//! promptly.
//!
//! Before mining, the worker prepends a reward transaction paying the
//! configured reward address, unless the candidate already carries one.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info};

use super::{WorkerHandle, WorkerRequest};
use crate::chain::transaction::BLOCK_REWARD;
use crate::chain::{meets_difficulty, Address, BlockCandidate, FinalizedBlock, Transaction};
use crate::config::{now_ms, DEFAULT_DIFFICULTY, MINING_SLICE, WORKER_QUEUE_DEPTH};
use crate::crypto::keys::NodeKeypair;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub enabled: bool,
    /// Leading zero bits required of a sealed hash.
    pub difficulty: u32,
    /// Hex address paid by the block reward. Defaults to the node's own.
    pub reward_address: Option<String>,
    /// Reward claimed per block, capped at the protocol reward.
    pub bet: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            difficulty: DEFAULT_DIFFICULTY,
            reward_address: None,
            bet: BLOCK_REWARD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinerRequest {
    /// Replace the current work with this candidate, no deadline.
    NewCandidate(BlockCandidate),
    UpdateInfo {
        reward_address: Address,
        bet: u64,
        /// Added to candidate timestamps, in milliseconds.
        time_offset: i64,
    },
    /// Mine `candidate` until sealed or until `deadline_ms` (unix ms).
    MineUntilValid { candidate: BlockCandidate, deadline_ms: u64 },
    Pause,
    Resume,
    Terminate,
}

impl WorkerRequest for MinerRequest {
    fn terminate() -> Self {
        Self::Terminate
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MinerResponse {
    Result(FinalizedBlock),
    Error(String),
    /// Hashes per second over the last finished job.
    HashRate(f64),
    Paused(bool),
}

#[derive(Debug, Clone, Copy)]
struct RewardInfo {
    address: Address,
    bet: u64,
    time_offset: i64,
}

struct Job {
    candidate: BlockCandidate,
    deadline_ms: Option<u64>,
    nonce: u64,
    started: Instant,
}

impl Job {
    fn new(mut candidate: BlockCandidate, deadline_ms: Option<u64>, info: &RewardInfo, keypair: &NodeKeypair) -> Self {
        candidate.timestamp = candidate.timestamp.saturating_add_signed(info.time_offset);
        let has_reward = candidate.transactions.first().is_some_and(Transaction::is_reward);
        if !has_reward {
            let reward = Transaction::reward(
                keypair,
                info.address,
                info.bet.min(BLOCK_REWARD),
                candidate.timestamp,
            );
            candidate.transactions.insert(0, reward);
        }
        Self {
            candidate,
            deadline_ms,
            nonce: 0,
            started: Instant::now(),
        }
    }
}

struct Miner {
    keypair: Arc<NodeKeypair>,
    info: RewardInfo,
    job: Option<Job>,
    paused: bool,
}

enum Step {
    Continue,
    Stop,
}

impl Miner {
    async fn handle(&mut self, request: MinerRequest, responses: &mpsc::Sender<MinerResponse>) -> Step {
        match request {
            MinerRequest::NewCandidate(candidate) => {
                debug!(index = candidate.index, "miner got new candidate");
                self.job = Some(Job::new(candidate, None, &self.info, &self.keypair));
            }
            MinerRequest::MineUntilValid { candidate, deadline_ms } => {
                self.job = Some(Job::new(candidate, Some(deadline_ms), &self.info, &self.keypair));
            }
            MinerRequest::UpdateInfo {
                reward_address,
                bet,
                time_offset,
            } => {
                self.info = RewardInfo {
                    address: reward_address,
                    bet,
                    time_offset,
                };
            }
            MinerRequest::Pause => return self.set_paused(true, responses).await,
            MinerRequest::Resume => return self.set_paused(false, responses).await,
            MinerRequest::Terminate => return Step::Stop,
        }
        Step::Continue
    }

    async fn set_paused(&mut self, paused: bool, responses: &mpsc::Sender<MinerResponse>) -> Step {
        self.paused = paused;
        match responses.send(MinerResponse::Paused(paused)).await {
            Ok(()) => Step::Continue,
            Err(_) => Step::Stop,
        }
    }

    /// Try one slice of nonces. Returns responses when the job ends.
    fn mine_slice(&mut self) -> Option<Vec<MinerResponse>> {
        let job = self.job.as_mut()?;
        if let Some(deadline) = job.deadline_ms {
            if now_ms() >= deadline {
                let index = job.candidate.index;
                self.job = None;
                return Some(vec![MinerResponse::Error(format!(
                    "deadline passed before block {index} was sealed"
                ))]);
            }
        }

        let difficulty = job.candidate.difficulty;
        for _ in 0..MINING_SLICE {
            let hash = job.candidate.hash_with_nonce(job.nonce);
            if meets_difficulty(&hash, difficulty) {
                let block = job.candidate.seal(job.nonce);
                let elapsed = job.started.elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 {
                    (job.nonce + 1) as f64 / elapsed
                } else {
                    0.0
                };
                info!(index = block.index, nonce = job.nonce, hash = %block.short_hash(), "block sealed");
                self.job = None;
                return Some(vec![MinerResponse::Result(block), MinerResponse::HashRate(rate)]);
            }
            job.nonce = job.nonce.wrapping_add(1);
        }
        None
    }
}

/// Spawn the mining worker. Blocks pay `reward_address` until an
/// `UpdateInfo` says otherwise.
pub fn spawn_miner(keypair: Arc<NodeKeypair>, reward_address: Address, bet: u64) -> WorkerHandle<MinerRequest, MinerResponse> {
    WorkerHandle::spawn("miner", WORKER_QUEUE_DEPTH, move |mut requests, responses| async move {
        let mut miner = Miner {
            keypair,
            info: RewardInfo {
                address: reward_address,
                bet,
                time_offset: 0,
            },
            job: None,
            paused: false,
        };
        loop {
            let busy = miner.job.is_some() && !miner.paused;
            let next = if busy {
                match requests.try_recv() {
                    Ok(request) => Some(request),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match requests.recv().await {
                    Some(request) => Some(request),
                    None => break,
                }
            };
            if let Some(request) = next {
                match miner.handle(request, &responses).await {
                    Step::Continue => continue,
                    Step::Stop => break,
                }
            }

            if let Some(out) = miner.mine_slice() {
                for response in out {
                    if responses.send(response).await.is_err() {
                        return;
                    }
                }
            }
            tokio::task::yield_now().await;
        }
        debug!("miner stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::address_of;
    use crate::workers::Termination;
    use std::time::Duration;

    fn candidate_on(parent: &FinalizedBlock, kp: &NodeKeypair, difficulty: u32) -> BlockCandidate {
        BlockCandidate {
            index: parent.index + 1,
            prev_hash: parent.hash,
            timestamp: 5_000,
            proposer: kp.peer_id(),
            transactions: Vec::new(),
            nonce: 0,
            difficulty,
        }
    }

    fn miner() -> (Arc<NodeKeypair>, Address, WorkerHandle<MinerRequest, MinerResponse>) {
        let kp = Arc::new(NodeKeypair::generate());
        let address = address_of(&kp.public_key_bytes());
        let handle = spawn_miner(Arc::clone(&kp), address, BLOCK_REWARD);
        (kp, address, handle)
    }

    #[tokio::test]
    async fn seals_candidate_with_reward() {
        let (kp, address, mut handle) = miner();
        let candidate = candidate_on(&FinalizedBlock::genesis(), &kp, 4);
        handle.send(MinerRequest::NewCandidate(candidate)).await.unwrap();

        let Some(MinerResponse::Result(block)) = handle.recv().await else {
            panic!("expected a sealed block");
        };
        assert!(block.verify().is_ok());
        assert!(meets_difficulty(&block.hash, 4));
        assert_eq!(block.transactions[0].outputs[0].address, address);
        assert_eq!(block.transactions[0].outputs[0].amount, BLOCK_REWARD);
        assert!(matches!(handle.recv().await, Some(MinerResponse::HashRate(_))));
    }

    #[tokio::test]
    async fn update_info_changes_reward_and_timestamp() {
        let (kp, _, mut handle) = miner();
        let other = address_of(&NodeKeypair::generate().public_key_bytes());
        handle
            .send(MinerRequest::UpdateInfo {
                reward_address: other,
                bet: 500,
                time_offset: -1_000,
            })
            .await
            .unwrap();
        let candidate = candidate_on(&FinalizedBlock::genesis(), &kp, 0);
        handle.send(MinerRequest::NewCandidate(candidate)).await.unwrap();

        let Some(MinerResponse::Result(block)) = handle.recv().await else {
            panic!("expected a sealed block");
        };
        assert_eq!(block.timestamp, 4_000);
        assert_eq!(block.transactions[0].outputs[0].address, other);
        assert_eq!(block.transactions[0].outputs[0].amount, BLOCK_REWARD);
    }

    #[tokio::test]
    async fn deadline_yields_error() {
        let (kp, _, mut handle) = miner();
        let candidate = candidate_on(&FinalizedBlock::genesis(), &kp, 255);
        handle
            .send(MinerRequest::MineUntilValid {
                candidate,
                deadline_ms: now_ms() + 50,
            })
            .await
            .unwrap();
        assert!(matches!(handle.recv().await, Some(MinerResponse::Error(_))));
    }

    #[tokio::test]
    async fn pause_resume_and_terminate() {
        let (_, _, mut handle) = miner();
        handle.send(MinerRequest::Pause).await.unwrap();
        assert_eq!(handle.recv().await, Some(MinerResponse::Paused(true)));
        handle.send(MinerRequest::Resume).await.unwrap();
        assert_eq!(handle.recv().await, Some(MinerResponse::Paused(false)));
        assert_eq!(
            handle.terminate(Duration::from_secs(1)).await,
            Termination::Graceful
        );
    }
}
