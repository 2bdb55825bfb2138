//! # Blocks
//!
//! Two shapes of block travel through Kestrel:
//!
//! - [`BlockCandidate`]: an unsealed proposal. It carries a difficulty and
//!   is handed to the miner, which searches for a nonce.
//! - [`FinalizedBlock`]: a sealed block with its hash. This is what the
//!   chain stores, peers serve and gossip announces.
//!
//! ## Hash computation
//!
//! ```text
//! hash = BLAKE3-derive-key("kestrel v1 block hash",
//!          index_be || prev_hash || timestamp_be || proposer
//!          || nonce_be || tx_root)
//! ```
//!
//! `tx_root` is the merkle root over transaction ids. Genesis is a fixed
//! block at index 0 with a zero `prev_hash`, so every node derives the same
//! genesis hash without a config file.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::transaction::Transaction;
use crate::config::MAX_BLOCK_TRANSACTIONS;
use crate::crypto::hash::{domain_separated_hash, merkle_root, short_hex, Hash32, ZERO_HASH};
use crate::crypto::keys::PeerId;

const BLOCK_HASH_CONTEXT: &str = "kestrel v1 block hash";

/// Timestamp baked into the genesis block.
pub const GENESIS_TIMESTAMP: u64 = 0;

/// Structural problems with a block, detected without any chain context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("block {index}: stored hash does not match contents")]
    HashMismatch { index: u64 },

    #[error("block {index}: {count} transactions exceeds limit")]
    TooManyTransactions { index: u64, count: usize },

    #[error("block {index}: duplicate transaction id")]
    DuplicateTransaction { index: u64 },

    #[error("block {index}: reward transaction must be first and unique")]
    MisplacedReward { index: u64 },

    #[error("block 0 must be the canonical genesis block")]
    BadGenesis,
}

// ---------------------------------------------------------------------------
// BlockCandidate
// ---------------------------------------------------------------------------

/// An unsealed block proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCandidate {
    pub index: u64,
    pub prev_hash: Hash32,
    pub timestamp: u64,
    pub proposer: PeerId,
    pub transactions: Vec<Transaction>,
    pub nonce: u64,
    /// Required leading zero bits of the sealed hash.
    pub difficulty: u32,
}

impl BlockCandidate {
    /// Candidates compete per `(index, prev_hash)` slot.
    pub fn slot(&self) -> (u64, Hash32) {
        (self.index, self.prev_hash)
    }

    /// Hash the candidate would have if sealed with `nonce`.
    pub fn hash_with_nonce(&self, nonce: u64) -> Hash32 {
        compute_block_hash(
            self.index,
            &self.prev_hash,
            self.timestamp,
            &self.proposer,
            nonce,
            &tx_root(&self.transactions),
        )
    }

    /// Seal with `nonce`. Does not check difficulty; see
    /// [`meets_difficulty`].
    pub fn seal(&self, nonce: u64) -> FinalizedBlock {
        FinalizedBlock {
            index: self.index,
            prev_hash: self.prev_hash,
            hash: self.hash_with_nonce(nonce),
            timestamp: self.timestamp,
            proposer: self.proposer.clone(),
            nonce,
            transactions: self.transactions.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// FinalizedBlock
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedBlock {
    pub index: u64,
    pub prev_hash: Hash32,
    pub hash: Hash32,
    pub timestamp: u64,
    pub proposer: PeerId,
    pub nonce: u64,
    pub transactions: Vec<Transaction>,
}

impl FinalizedBlock {
    /// The deterministic genesis block.
    pub fn genesis() -> Self {
        let proposer = PeerId::from_public_key(&[0u8; 32]);
        let hash = compute_block_hash(
            0,
            &ZERO_HASH,
            GENESIS_TIMESTAMP,
            &proposer,
            0,
            &ZERO_HASH,
        );
        Self {
            index: 0,
            prev_hash: ZERO_HASH,
            hash,
            timestamp: GENESIS_TIMESTAMP,
            proposer,
            nonce: 0,
            transactions: Vec::new(),
        }
    }

    pub fn compute_hash(&self) -> Hash32 {
        compute_block_hash(
            self.index,
            &self.prev_hash,
            self.timestamp,
            &self.proposer,
            self.nonce,
            &tx_root(&self.transactions),
        )
    }

    /// Structural checks that need no chain context:
    ///
    /// 1. Index 0 is the canonical genesis.
    /// 2. The stored hash matches the contents.
    /// 3. Transaction count is within limits.
    /// 4. Transaction ids are unique.
    /// 5. At most one reward transaction, and only in first position.
    pub fn verify(&self) -> Result<(), BlockError> {
        if self.index == 0 {
            return if *self == Self::genesis() {
                Ok(())
            } else {
                Err(BlockError::BadGenesis)
            };
        }

        if self.hash != self.compute_hash() {
            return Err(BlockError::HashMismatch { index: self.index });
        }

        if self.transactions.len() > MAX_BLOCK_TRANSACTIONS {
            return Err(BlockError::TooManyTransactions {
                index: self.index,
                count: self.transactions.len(),
            });
        }

        let mut ids = HashSet::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            if !ids.insert(tx.id()) {
                return Err(BlockError::DuplicateTransaction { index: self.index });
            }
        }

        let misplaced_reward = self
            .transactions
            .iter()
            .enumerate()
            .any(|(pos, tx)| tx.is_reward() && pos != 0);
        if misplaced_reward {
            return Err(BlockError::MisplacedReward { index: self.index });
        }

        Ok(())
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn short_hash(&self) -> String {
        short_hex(&self.hash)
    }
}

// ---------------------------------------------------------------------------
// Hash Computation
// ---------------------------------------------------------------------------

/// Merkle root over transaction ids.
pub fn tx_root(transactions: &[Transaction]) -> Hash32 {
    let ids: Vec<Hash32> = transactions.iter().map(Transaction::id).collect();
    merkle_root(&ids)
}

fn compute_block_hash(
    index: u64,
    prev_hash: &Hash32,
    timestamp: u64,
    proposer: &PeerId,
    nonce: u64,
    tx_root: &Hash32,
) -> Hash32 {
    let proposer = proposer.as_str().as_bytes();
    let mut preimage = Vec::with_capacity(8 + 32 + 8 + proposer.len() + 8 + 32);
    preimage.extend_from_slice(&index.to_be_bytes());
    preimage.extend_from_slice(prev_hash);
    preimage.extend_from_slice(&timestamp.to_be_bytes());
    preimage.extend_from_slice(proposer);
    preimage.extend_from_slice(&nonce.to_be_bytes());
    preimage.extend_from_slice(tx_root);
    domain_separated_hash(BLOCK_HASH_CONTEXT, &preimage)
}

/// Whether `hash` has at least `difficulty` leading zero bits.
pub fn meets_difficulty(hash: &Hash32, difficulty: u32) -> bool {
    let mut remaining = difficulty;
    for byte in hash {
        if remaining == 0 {
            return true;
        }
        if remaining >= 8 {
            if *byte != 0 {
                return false;
            }
            remaining -= 8;
        } else {
            return byte.leading_zeros() >= remaining;
        }
    }
    remaining == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::transaction::{address_of, Transaction, TxOutput};
    use crate::crypto::keys::NodeKeypair;

    fn candidate(kp: &NodeKeypair, parent: &FinalizedBlock, txs: Vec<Transaction>) -> BlockCandidate {
        BlockCandidate {
            index: parent.index + 1,
            prev_hash: parent.hash,
            timestamp: 1_000,
            proposer: kp.peer_id(),
            transactions: txs,
            nonce: 0,
            difficulty: 0,
        }
    }

    fn reward(kp: &NodeKeypair) -> Transaction {
        Transaction::reward(kp, address_of(&kp.public_key_bytes()), 50, 1_000)
    }

    #[test]
    fn genesis_is_deterministic_and_valid() {
        let g1 = FinalizedBlock::genesis();
        let g2 = FinalizedBlock::genesis();
        assert_eq!(g1.hash, g2.hash);
        assert_eq!(g1.prev_hash, ZERO_HASH);
        assert!(g1.verify().is_ok());
    }

    #[test]
    fn tampered_genesis_rejected() {
        let mut g = FinalizedBlock::genesis();
        g.timestamp = 1;
        assert_eq!(g.verify(), Err(BlockError::BadGenesis));
    }

    #[test]
    fn sealed_candidate_verifies() {
        let kp = NodeKeypair::generate();
        let block = candidate(&kp, &FinalizedBlock::genesis(), vec![reward(&kp)]).seal(7);
        assert_eq!(block.index, 1);
        assert_eq!(block.nonce, 7);
        assert!(block.verify().is_ok());
    }

    #[test]
    fn tampered_transactions_break_hash() {
        let kp = NodeKeypair::generate();
        let mut block = candidate(&kp, &FinalizedBlock::genesis(), vec![reward(&kp)]).seal(0);
        block.transactions.clear();
        assert_eq!(block.verify(), Err(BlockError::HashMismatch { index: 1 }));
    }

    #[test]
    fn reward_must_be_first() {
        let kp = NodeKeypair::generate();
        let transfer = Transaction::new_signed(
            &kp,
            vec![crate::chain::transaction::OutPoint {
                tx_id: [9u8; 32],
                output: 0,
            }],
            vec![TxOutput {
                address: [1u8; 32],
                amount: 1,
            }],
            1_000,
        );
        let block =
            candidate(&kp, &FinalizedBlock::genesis(), vec![transfer, reward(&kp)]).seal(0);
        assert_eq!(block.verify(), Err(BlockError::MisplacedReward { index: 1 }));
    }

    #[test]
    fn two_rewards_rejected() {
        let kp = NodeKeypair::generate();
        let mut second = reward(&kp);
        second.timestamp += 1;
        let block =
            candidate(&kp, &FinalizedBlock::genesis(), vec![reward(&kp), second]).seal(0);
        assert_eq!(block.verify(), Err(BlockError::MisplacedReward { index: 1 }));
    }

    #[test]
    fn duplicate_transactions_rejected() {
        let kp = NodeKeypair::generate();
        let tx = reward(&kp);
        let block =
            candidate(&kp, &FinalizedBlock::genesis(), vec![tx.clone(), tx]).seal(0);
        assert_eq!(
            block.verify(),
            Err(BlockError::DuplicateTransaction { index: 1 })
        );
    }

    #[test]
    fn difficulty_check() {
        let mut hash = [0xFFu8; 32];
        assert!(meets_difficulty(&hash, 0));
        assert!(!meets_difficulty(&hash, 1));

        hash[0] = 0x00;
        hash[1] = 0x1F;
        assert!(meets_difficulty(&hash, 11));
        assert!(!meets_difficulty(&hash, 12));
    }

    #[test]
    fn block_serialization_roundtrip() {
        let kp = NodeKeypair::generate();
        let block = candidate(&kp, &FinalizedBlock::genesis(), vec![reward(&kp)]).seal(3);
        let encoded = bincode::serialize(&block).unwrap();
        let decoded: FinalizedBlock = bincode::deserialize(&encoded).unwrap();
        assert_eq!(block, decoded);
        assert!(decoded.verify().is_ok());
    }
}
