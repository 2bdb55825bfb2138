//! # Block Storage
//!
//! Finalized blocks are persisted through the [`BlockStore`] trait. The sync
//! engine is the only writer; it calls `put_block` after every apply and
//! `truncate` before replaying a reorg branch.
//!
//! ```text
//! db.rs      SledBlockStore: sled trees, bincode values
//! memory.rs  MemoryBlockStore: tests and ephemeral nodes
//! ```
//!
//! ## Design Decisions
//!
//! 1. **Synchronous trait.** sled calls are short and non-blocking in
//!    practice; the engine invokes them under its apply gate.
//!
//! 2. **Index-keyed, hash-indexed.** Blocks are keyed by big-endian index
//!    so range scans run in chain order. The hash index is a secondary
//!    lookup that is cross-checked on read, so a stale hash entry left by a
//!    reorg can never return the wrong block.

pub mod db;
pub mod memory;

use crate::chain::FinalizedBlock;
use crate::crypto::hash::Hash32;

pub use db::SledBlockStore;
pub use memory::MemoryBlockStore;

/// Errors from a block store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store is corrupt: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// How to address a stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Index(u64),
    Hash(Hash32),
}

/// Key-value persistence for finalized blocks.
pub trait BlockStore: Send + Sync {
    fn get_block(&self, block: BlockRef) -> StoreResult<Option<FinalizedBlock>>;

    /// Store `block` at its index, replacing whatever was there.
    fn put_block(&self, block: &FinalizedBlock) -> StoreResult<()>;

    /// Highest stored index, `None` for an empty store.
    fn latest_index(&self) -> StoreResult<Option<u64>>;

    /// Remove every block above `index`.
    fn truncate(&self, index: u64) -> StoreResult<()>;

    /// Every stored block from index 0 upward. Stops at the first gap.
    fn load_all(&self) -> StoreResult<Vec<FinalizedBlock>> {
        let Some(latest) = self.latest_index()? else {
            return Ok(Vec::new());
        };
        let mut blocks = Vec::with_capacity(latest as usize + 1);
        for index in 0..=latest {
            match self.get_block(BlockRef::Index(index))? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }
}
