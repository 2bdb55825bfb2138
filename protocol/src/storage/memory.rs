//! In-memory [`BlockStore`] for tests and throwaway nodes.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::{BlockRef, BlockStore, StoreResult};
use crate::chain::FinalizedBlock;
use crate::crypto::hash::Hash32;

#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    blocks: BTreeMap<u64, FinalizedBlock>,
    hashes: HashMap<Hash32, u64>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().blocks.is_empty()
    }
}

impl BlockStore for MemoryBlockStore {
    fn get_block(&self, block: BlockRef) -> StoreResult<Option<FinalizedBlock>> {
        let inner = self.inner.read();
        Ok(match block {
            BlockRef::Index(index) => inner.blocks.get(&index).cloned(),
            BlockRef::Hash(hash) => inner
                .hashes
                .get(&hash)
                .and_then(|index| inner.blocks.get(index))
                .filter(|b| b.hash == hash)
                .cloned(),
        })
    }

    fn put_block(&self, block: &FinalizedBlock) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.hashes.insert(block.hash, block.index);
        inner.blocks.insert(block.index, block.clone());
        Ok(())
    }

    fn latest_index(&self) -> StoreResult<Option<u64>> {
        Ok(self.inner.read().blocks.keys().next_back().copied())
    }

    fn truncate(&self, index: u64) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let removed = inner.blocks.split_off(&index.saturating_add(1));
        for block in removed.values() {
            inner.hashes.remove(&block.hash);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::state::tests::child;
    use crate::crypto::keys::NodeKeypair;

    #[test]
    fn behaves_like_a_block_store() {
        let kp = NodeKeypair::generate();
        let store = MemoryBlockStore::new();
        let genesis = FinalizedBlock::genesis();
        let b1 = child(&genesis, &kp, 0);
        let b2 = child(&b1, &kp, 0);
        for block in [&genesis, &b1, &b2] {
            store.put_block(block).unwrap();
        }

        assert_eq!(store.latest_index().unwrap(), Some(2));
        assert_eq!(store.get_block(BlockRef::Hash(b1.hash)).unwrap(), Some(b1.clone()));

        store.truncate(1).unwrap();
        assert_eq!(store.latest_index().unwrap(), Some(1));
        assert!(store.get_block(BlockRef::Hash(b2.hash)).unwrap().is_none());
        assert_eq!(store.load_all().unwrap(), vec![genesis, b1]);
    }
}
