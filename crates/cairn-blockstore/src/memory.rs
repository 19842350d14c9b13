//! In-memory block store for testing and caching

use crate::cid_utils::verify_cid;
use crate::{Block, BlockFetcher, BlockStore, BlockStoreError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use dashmap::DashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// An in-memory block store
///
/// Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<DashMap<Cid, Bytes>>,
}

impl MemoryBlockStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self {
            blocks: Arc::new(DashMap::new()),
        }
    }

    /// Create a store pre-populated with blocks
    pub fn with_blocks(blocks: impl IntoIterator<Item = Block>) -> Self {
        let store = Self::new();
        for block in blocks {
            store.insert(block);
        }
        store
    }

    /// Insert a block without going through the async interface
    pub fn insert(&self, block: Block) {
        self.blocks.insert(block.cid, block.data);
    }

    /// Remove a block without going through the async interface
    pub fn remove(&self, cid: &Cid) {
        self.blocks.remove(cid);
    }

    /// Check for a block without going through the async interface
    pub fn contains(&self, cid: &Cid) -> bool {
        self.blocks.contains_key(cid)
    }

    /// Get the number of blocks stored
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Clear all blocks
    pub fn clear(&self) {
        self.blocks.clear();
    }

    /// Get total size of all blocks
    pub fn total_size(&self) -> u64 {
        self.blocks.iter().map(|entry| entry.value().len() as u64).sum()
    }

    /// List all CIDs
    pub fn list_cids(&self) -> Vec<Cid> {
        self.blocks.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshot every stored block
    pub fn blocks(&self) -> Vec<Block> {
        self.blocks
            .iter()
            .map(|entry| Block::new(*entry.key(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl BlockFetcher for MemoryBlockStore {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Bytes>> {
        Ok(self.blocks.get(cid).map(|entry| entry.value().clone()))
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put_block(&self, block: Block) -> Result<()> {
        if !verify_cid(&block.data, &block.cid) {
            return Err(BlockStoreError::HashMismatch(block.cid));
        }
        self.insert(block);
        Ok(())
    }

    async fn has_block(&self, cid: &Cid) -> Result<bool> {
        Ok(self.contains(cid))
    }

    async fn delete_block(&self, cid: &Cid) -> Result<()> {
        self.remove(cid);
        Ok(())
    }
}

/// LRU-cached wrapper around any block store
pub struct CachedBlockStore<S: BlockStore> {
    inner: S,
    cache: Arc<parking_lot::Mutex<lru::LruCache<Cid, Bytes>>>,
}

impl<S: BlockStore> CachedBlockStore<S> {
    /// Create a new cached store with the given capacity (at least one entry)
    pub fn new(inner: S, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Arc::new(parking_lot::Mutex::new(lru::LruCache::new(capacity))),
        }
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Get cache statistics
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Access the wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: BlockStore> BlockFetcher for CachedBlockStore<S> {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Bytes>> {
        if let Some(data) = self.cache.lock().get(cid) {
            return Ok(Some(data.clone()));
        }

        tracing::trace!(%cid, "block cache miss");
        let data = self.inner.get_block(cid).await?;
        if let Some(data) = &data {
            self.cache.lock().put(*cid, data.clone());
        }
        Ok(data)
    }
}

#[async_trait]
impl<S: BlockStore> BlockStore for CachedBlockStore<S> {
    async fn put_block(&self, block: Block) -> Result<()> {
        let cid = block.cid;
        let data = block.data.clone();
        self.inner.put_block(block).await?;
        self.cache.lock().put(cid, data);
        Ok(())
    }

    async fn has_block(&self, cid: &Cid) -> Result<bool> {
        if self.cache.lock().contains(cid) {
            return Ok(true);
        }
        self.inner.has_block(cid).await
    }

    async fn delete_block(&self, cid: &Cid) -> Result<()> {
        self.cache.lock().pop(cid);
        self.inner.delete_block(cid).await
    }
}
