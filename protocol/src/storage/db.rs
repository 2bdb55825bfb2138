//! # SledBlockStore
//!
//! sled-backed [`BlockStore`].
//!
//! | Tree           | Key              | Value                    |
//! |----------------|------------------|--------------------------|
//! | `blocks`       | index (8B BE)    | `bincode(FinalizedBlock)`|
//! | `block_hashes` | hash (32B)       | index (8B BE)            |
//! | `metadata`     | key (UTF-8)      | value (bytes)            |
//!
//! Big-endian index keys make sled's lexicographic order match numeric
//! order, so `last()` on the `blocks` tree is the head.

use std::path::Path;

use sled::{Db, Tree};

use super::{BlockRef, BlockStore, StoreError, StoreResult};
use crate::chain::FinalizedBlock;

const META_LATEST_INDEX: &[u8] = b"latest_index";

#[derive(Debug, Clone)]
pub struct SledBlockStore {
    db: Db,
    blocks: Tree,
    block_hashes: Tree,
    metadata: Tree,
}

impl SledBlockStore {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// A store that lives in a temporary directory removed on drop.
    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            block_hashes: db.open_tree("block_hashes")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    fn decode(bytes: &[u8]) -> StoreResult<FinalizedBlock> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_by_index(&self, index: u64) -> StoreResult<Option<FinalizedBlock>> {
        match self.blocks.get(index.to_be_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Approximate on-disk size, for status reporting.
    pub fn size_on_disk(&self) -> StoreResult<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

impl BlockStore for SledBlockStore {
    fn get_block(&self, block: BlockRef) -> StoreResult<Option<FinalizedBlock>> {
        match block {
            BlockRef::Index(index) => self.get_by_index(index),
            BlockRef::Hash(hash) => {
                let Some(index_bytes) = self.block_hashes.get(hash)? else {
                    return Ok(None);
                };
                let index = u64::from_be_bytes(
                    index_bytes
                        .as_ref()
                        .try_into()
                        .map_err(|_| StoreError::Corrupt("bad index bytes in hash index".into()))?,
                );
                // A reorg may have replaced the block at that index.
                Ok(self.get_by_index(index)?.filter(|b| b.hash == hash))
            }
        }
    }

    fn put_block(&self, block: &FinalizedBlock) -> StoreResult<()> {
        let key = block.index.to_be_bytes();
        let bytes =
            bincode::serialize(block).map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.blocks.insert(key, bytes)?;
        self.block_hashes.insert(block.hash, &key)?;

        let latest = self.latest_index()?.unwrap_or(0);
        if block.index >= latest {
            self.metadata.insert(META_LATEST_INDEX, &key)?;
        }

        self.db.flush()?;
        Ok(())
    }

    fn latest_index(&self) -> StoreResult<Option<u64>> {
        match self.metadata.get(META_LATEST_INDEX)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("bad latest index".into()))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn truncate(&self, index: u64) -> StoreResult<()> {
        let start = index.saturating_add(1).to_be_bytes();
        let doomed: Vec<_> = self
            .blocks
            .range(start..)
            .collect::<Result<Vec<_>, _>>()?;
        if doomed.is_empty() {
            return Ok(());
        }
        for (key, value) in doomed {
            let block = Self::decode(&value)?;
            self.block_hashes.remove(block.hash)?;
            self.blocks.remove(key)?;
        }
        self.metadata.insert(META_LATEST_INDEX, &index.to_be_bytes())?;
        self.db.flush()?;
        Ok(())
    }
}
