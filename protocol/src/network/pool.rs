//! Pending transaction pool.
//!
//! Holds transactions submitted locally or heard by gossip until a block
//! includes them. Entries are served to the miner in arrival order.
//!
//! ## Design
//!
//! - `DashMap` keyed by transaction id gives lock-free duplicate checks on
//!   the gossip hot path.
//! - An arrival-ordered `BTreeMap` behind a `parking_lot::RwLock` feeds
//!   candidate building.
//! - Every input a pending transaction spends is claimed in a second map,
//!   so two pending spends of the same output cannot coexist.
//! - Per-sender counts stop one address from filling the pool.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::chain::{Address, FinalizedBlock, OutPoint, Transaction};
use crate::config::{POOL_MAX_PER_SENDER, POOL_MAX_SIZE};
use crate::crypto::hash::{short_hex, Hash32};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    pub max_per_sender: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: POOL_MAX_SIZE,
            max_per_sender: POOL_MAX_PER_SENDER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("transaction already pending")]
    Duplicate,

    #[error("reward transactions are only created by miners")]
    Reward,

    #[error("input already spent by pending transaction {0}")]
    Conflict(String),

    #[error("sender exceeded the limit of {0} pending transactions")]
    SenderLimit(usize),

    #[error("pool is full ({0} transactions)")]
    Full(usize),
}

#[derive(Debug, Clone)]
struct PoolEntry {
    transaction: Transaction,
    seq: u64,
}

#[derive(Debug)]
pub struct TxPool {
    entries: DashMap<Hash32, PoolEntry>,
    order: RwLock<BTreeMap<u64, Hash32>>,
    claims: DashMap<OutPoint, Hash32>,
    sender_counts: DashMap<Address, usize>,
    next_seq: AtomicU64,
    config: PoolConfig,
}

impl TxPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            entries: DashMap::new(),
            order: RwLock::new(BTreeMap::new()),
            claims: DashMap::new(),
            sender_counts: DashMap::new(),
            next_seq: AtomicU64::new(0),
            config,
        }
    }

    /// Add a transaction that already passed validation against the chain.
    pub fn add(&self, tx: Transaction) -> Result<Hash32, PoolError> {
        if tx.is_reward() {
            return Err(PoolError::Reward);
        }
        let id = tx.id();
        if self.entries.contains_key(&id) {
            return Err(PoolError::Duplicate);
        }
        for input in &tx.inputs {
            if let Some(holder) = self.claims.get(input) {
                return Err(PoolError::Conflict(short_hex(holder.value())));
            }
        }
        let sender = tx.sender_address();
        if self.sender_counts.get(&sender).map_or(0, |c| *c) >= self.config.max_per_sender {
            return Err(PoolError::SenderLimit(self.config.max_per_sender));
        }
        if self.entries.len() >= self.config.max_size {
            return Err(PoolError::Full(self.config.max_size));
        }

        for input in &tx.inputs {
            self.claims.insert(*input, id);
        }
        *self.sender_counts.entry(sender).or_insert(0) += 1;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.order.write().insert(seq, id);
        self.entries.insert(id, PoolEntry { transaction: tx, seq });
        Ok(id)
    }

    pub fn remove(&self, id: &Hash32) -> Option<Transaction> {
        let (_, entry) = self.entries.remove(id)?;
        self.order.write().remove(&entry.seq);
        for input in &entry.transaction.inputs {
            self.claims.remove_if(input, |_, holder| holder == id);
        }
        let sender = entry.transaction.sender_address();
        let emptied = match self.sender_counts.get_mut(&sender) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if emptied {
            self.sender_counts.remove(&sender);
        }
        Some(entry.transaction)
    }

    /// Drop what `block` included, plus anything that now conflicts with it.
    pub fn prune_block(&self, block: &FinalizedBlock) -> usize {
        let mut removed = 0;
        for tx in &block.transactions {
            if self.remove(&tx.id()).is_some() {
                removed += 1;
            }
            for input in &tx.inputs {
                let holder = self.claims.get(input).map(|h| *h.value());
                if let Some(holder) = holder {
                    if self.remove(&holder).is_some() {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    /// Up to `max` transactions, oldest first.
    pub fn select(&self, max: usize) -> Vec<Transaction> {
        let order = self.order.read();
        order
            .values()
            .filter_map(|id| self.entries.get(id).map(|e| e.transaction.clone()))
            .take(max)
            .collect()
    }

    pub fn contains(&self, id: &Hash32) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
