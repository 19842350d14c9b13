//! Shard loading with a decode cache

use super::{decode_with_cid, Shard, ShardBlock};
use crate::{CoreError, Result};
use bytes::Bytes;
use cairn_blockstore::BlockFetcher;
use cid::Cid;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Number of decoded shards a fetcher keeps by default
pub const DEFAULT_DECODE_CACHE: usize = 256;

/// Loads and decodes shards from a block fetcher.
///
/// Decoded shards are cached per fetcher, so a traversal that revisits a
/// shard decodes it once.
pub struct ShardFetcher<F: BlockFetcher> {
    blocks: F,
    cache: Mutex<LruCache<Cid, (Bytes, Shard)>>,
}

impl<F: BlockFetcher> ShardFetcher<F> {
    /// Create a fetcher with the default cache capacity
    pub fn new(blocks: F) -> Self {
        Self::with_capacity(blocks, DEFAULT_DECODE_CACHE)
    }

    /// Create a fetcher caching up to `capacity` decoded shards (at least one)
    pub fn with_capacity(blocks: F, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            blocks,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// The underlying block fetcher
    pub fn blocks(&self) -> &F {
        &self.blocks
    }

    /// Fetch and decode the shard at `link`, tagging it with `prefix`
    pub async fn get(&self, link: &Cid, prefix: impl Into<String>) -> Result<ShardBlock> {
        let cached = self.cache.lock().get(link).cloned();
        let (bytes, shard) = match cached {
            Some(hit) => hit,
            None => {
                let bytes = self
                    .blocks
                    .get_block(link)
                    .await?
                    .ok_or(CoreError::MissingBlock(*link))?;
                let shard = decode_with_cid(link, &bytes)?;
                self.cache.lock().put(*link, (bytes.clone(), shard.clone()));
                (bytes, shard)
            }
        };

        Ok(ShardBlock {
            cid: *link,
            bytes,
            shard,
            prefix: prefix.into(),
        })
    }

    /// Seed the cache with a block the caller just produced
    pub fn remember(&self, block: &ShardBlock) {
        self.cache
            .lock()
            .put(block.cid, (block.bytes.clone(), block.shard.clone()));
    }

    /// Number of decoded shards currently cached
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{encode_block, Entry, EntryValue, ShardConfig};
    use cairn_blockstore::{create_cid, Block, CidCodec, MemoryBlockStore};

    #[tokio::test]
    async fn test_get_decodes_and_caches() {
        let store = MemoryBlockStore::new();
        let value = create_cid(b"v", CidCodec::Raw);
        let shard = Shard::with_entries(vec![Entry::new("k", EntryValue::Value(value))], ShardConfig::default());
        let block = encode_block(shard.clone(), "").unwrap();
        store.insert(block.to_block());

        let fetcher = ShardFetcher::new(&store);
        let fetched = fetcher.get(&block.cid, "pre").await.unwrap();
        assert_eq!(fetched.shard, shard);
        assert_eq!(fetched.prefix, "pre");
        assert_eq!(fetcher.cache_len(), 1);

        // served from the cache once the store forgets it
        store.clear();
        let again = fetcher.get(&block.cid, "").await.unwrap();
        assert_eq!(again.cid, block.cid);
    }

    #[tokio::test]
    async fn test_get_missing_block() {
        let store = MemoryBlockStore::new();
        let fetcher = ShardFetcher::new(&store);
        let cid = create_cid(b"absent", CidCodec::DagCbor);

        let err = fetcher.get(&cid, "").await.unwrap_err();
        assert!(matches!(err, CoreError::MissingBlock(missing) if missing == cid));
    }

    #[tokio::test]
    async fn test_get_invalid_block() {
        let store = MemoryBlockStore::new();
        let block = Block::from_data(b"not cbor at all".as_slice(), CidCodec::DagCbor);
        store.insert(block.clone());

        let fetcher = ShardFetcher::new(&store);
        let err = fetcher.get(&block.cid, "").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidShard { cid, .. } if cid == block.cid));
    }
}
