//! In-memory finalized chain with a hash index.
//!
//! `ChainState` only enforces linkage (index and `prev_hash` continuity).
//! Structural and transaction validation happen before a block gets here.

use std::collections::HashMap;

use super::block::FinalizedBlock;
use crate::crypto::hash::{short_hex, Hash32};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("expected block {expected}, got {got}")]
    IndexGap { expected: u64, got: u64 },

    #[error("block {index} does not link to head {head}")]
    BrokenLink { index: u64, head: String },

    #[error("chain must start at the canonical genesis block")]
    WrongGenesis,
}

/// The finalized chain. Never empty: index 0 is always genesis.
#[derive(Debug, Clone)]
pub struct ChainState {
    blocks: Vec<FinalizedBlock>,
    by_hash: HashMap<Hash32, u64>,
}

impl ChainState {
    pub fn new() -> Self {
        let genesis = FinalizedBlock::genesis();
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash, 0);
        Self {
            blocks: vec![genesis],
            by_hash,
        }
    }

    /// Rebuild from a stored sequence, checking genesis and linkage.
    pub fn from_blocks(blocks: Vec<FinalizedBlock>) -> Result<Self, ChainError> {
        let mut iter = blocks.into_iter();
        match iter.next() {
            Some(first) if first == FinalizedBlock::genesis() => {}
            _ => return Err(ChainError::WrongGenesis),
        }
        let mut chain = Self::new();
        for block in iter {
            chain.append(block)?;
        }
        Ok(chain)
    }

    pub fn head(&self) -> &FinalizedBlock {
        // Never empty, see `new`.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn height(&self) -> u64 {
        self.head().index
    }

    pub fn get(&self, index: u64) -> Option<&FinalizedBlock> {
        self.blocks.get(usize::try_from(index).ok()?)
    }

    pub fn get_by_hash(&self, hash: &Hash32) -> Option<&FinalizedBlock> {
        self.by_hash.get(hash).and_then(|index| self.get(*index))
    }

    pub fn contains_hash(&self, hash: &Hash32) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Blocks in `start..=end`, clipped to what exists.
    pub fn range(&self, start: u64, end: u64) -> Vec<FinalizedBlock> {
        if start > end {
            return Vec::new();
        }
        (start..=end.min(self.height()))
            .filter_map(|index| self.get(index).cloned())
            .collect()
    }

    pub fn blocks(&self) -> &[FinalizedBlock] {
        &self.blocks
    }

    /// Whether `block` would extend the current head.
    pub fn extends_head(&self, block: &FinalizedBlock) -> bool {
        block.index == self.height() + 1 && block.prev_hash == self.head().hash
    }

    /// Append a block that extends the head.
    pub fn append(&mut self, block: FinalizedBlock) -> Result<(), ChainError> {
        let expected = self.height() + 1;
        if block.index != expected {
            return Err(ChainError::IndexGap {
                expected,
                got: block.index,
            });
        }
        if block.prev_hash != self.head().hash {
            return Err(ChainError::BrokenLink {
                index: block.index,
                head: short_hex(&self.head().hash),
            });
        }
        self.by_hash.insert(block.hash, block.index);
        self.blocks.push(block);
        Ok(())
    }

    /// Drop every block above `index` and return them, lowest first.
    /// Genesis is never removed.
    pub fn truncate(&mut self, index: u64) -> Vec<FinalizedBlock> {
        if index >= self.height() {
            return Vec::new();
        }
        // index < height <= len - 1, so this fits.
        let removed = self.blocks.split_off(index as usize + 1);
        for block in &removed {
            self.by_hash.remove(&block.hash);
        }
        removed
    }
}

impl Default for ChainState {
    fn default() -> Self {
        Self::new()
    }
}
