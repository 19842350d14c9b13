//! A bucket replica: a clock head over a writable block store

use crate::clock::{self, EventFetcher};
use crate::crdt::{self, BatchOp, Change, CrdtResult, Operation};
use crate::shard::{ShardConfig, ShardFetcher, DEFAULT_DECODE_CACHE};
use crate::trie::{self, EntriesOptions};
use crate::Result;
use cairn_blockstore::{Block, BlockStore};
use cid::Cid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Configuration for bucket behavior
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketConfig {
    /// Limits for the root shard of a new bucket
    pub shard: ShardConfig,
    /// Decoded shards kept for reads
    pub decode_cache_capacity: usize,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            shard: ShardConfig::default(),
            decode_cache_capacity: DEFAULT_DECODE_CACHE,
        }
    }
}

/// One replica of a bucket.
///
/// Writes persist their shards and events into the store and move the head
/// forward. Events from other replicas are merged with [`Bucket::merge`]
/// once their blocks are in the store.
pub struct Bucket<S: BlockStore> {
    shards: ShardFetcher<Arc<S>>,
    head: Vec<Cid>,
    config: BucketConfig,
}

impl<S: BlockStore> Bucket<S> {
    /// Create an empty bucket
    pub fn new(store: Arc<S>, config: BucketConfig) -> Self {
        Self::load(store, Vec::new(), config)
    }

    /// Open a bucket at an existing head
    pub fn load(store: Arc<S>, head: Vec<Cid>, config: BucketConfig) -> Self {
        Self {
            shards: ShardFetcher::with_capacity(store, config.decode_cache_capacity),
            head,
            config,
        }
    }

    /// Current clock head
    pub fn head(&self) -> &[Cid] {
        &self.head
    }

    /// Bucket configuration
    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Backing block store
    pub fn store(&self) -> &Arc<S> {
        self.shards.blocks()
    }

    /// Put a value for a key
    #[instrument(skip(self, value))]
    pub async fn put(&mut self, key: &str, value: Cid) -> Result<CrdtResult> {
        let change = Change::Put {
            key: key.to_string(),
            value,
        };
        self.write(change).await
    }

    /// Delete the value for a key
    #[instrument(skip(self))]
    pub async fn del(&mut self, key: &str) -> Result<CrdtResult> {
        self.write(Change::Del { key: key.to_string() }).await
    }

    /// Apply several writes as one event
    #[instrument(skip_all, fields(ops = ops.len()))]
    pub async fn batch(&mut self, ops: Vec<BatchOp>) -> Result<CrdtResult> {
        self.write(Change::Batch(ops)).await
    }

    async fn write(&mut self, change: Change) -> Result<CrdtResult> {
        let result = crdt::apply(self.store().as_ref(), &self.head, change, self.config.shard).await?;
        for shard in &result.additions {
            self.store().put_block(shard.to_block()).await?;
            self.shards.remember(shard);
        }
        if let Some(event) = &result.event {
            self.store().put_block(event.to_block()).await?;
        }
        self.head.clone_from(&result.head);
        Ok(result)
    }

    /// Get the value for a key
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<Cid>> {
        match self.head.as_slice() {
            [] => Ok(None),
            [only] => {
                let root = self.event_root(only).await?;
                trie::get_with(&self.shards, &root, key).await
            }
            head => crdt::get(self.store().as_ref(), head, key).await,
        }
    }

    /// Collect the entries matching `options`
    pub async fn entries(&self, options: EntriesOptions) -> Result<Vec<(String, Cid)>> {
        crdt::entries_vec(self.store().as_ref(), &self.head, options).await
    }

    /// Effective root, storing any shards produced to resolve it
    #[instrument(skip(self))]
    pub async fn root(&self) -> Result<Option<Cid>> {
        let Some(resolved) = crdt::root(self.store().as_ref(), &self.head).await? else {
            return Ok(None);
        };
        for shard in &resolved.additions {
            self.store().put_block(shard.to_block()).await?;
        }
        Ok(Some(resolved.root))
    }

    /// Copy blocks received from another replica into the store
    pub async fn import(&self, blocks: impl IntoIterator<Item = Block>) -> Result<()> {
        for block in blocks {
            self.store().put_block(block).await?;
        }
        Ok(())
    }

    /// Advance the head with events from another replica.
    ///
    /// The events and the shards they reference must already be stored.
    #[instrument(skip_all, fields(events = events.len()))]
    pub async fn merge(&mut self, events: &[Cid]) -> Result<&[Cid]> {
        for event in events {
            self.head = clock::advance(self.store().as_ref(), &self.head, event).await?;
        }
        debug!(head = self.head.len(), "merged remote events");
        Ok(&self.head)
    }

    /// Render the clock as Graphviz DOT lines
    pub async fn visualize(&self) -> Result<Vec<String>> {
        clock::visualize(self.store().as_ref(), &self.head).await
    }

    async fn event_root(&self, link: &Cid) -> Result<Cid> {
        let events: EventFetcher<_, Operation> = EventFetcher::new(self.store().as_ref());
        Ok(*events.get(link).await?.event.data.root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_blockstore::{create_cid, CidCodec, MemoryBlockStore};

    fn link(seed: &str) -> Cid {
        create_cid(seed.as_bytes(), CidCodec::Raw)
    }

    fn bucket() -> Bucket<MemoryBlockStore> {
        Bucket::new(Arc::new(MemoryBlockStore::new()), BucketConfig::default())
    }

    #[test]
    fn test_config_from_json() {
        let config: BucketConfig =
            serde_json::from_str(r#"{"shard": {"maxKeyLength": 4}, "decodeCacheCapacity": 8}"#).unwrap();
        assert_eq!(config.shard.max_key_length, 4);
        assert_eq!(config.shard.max_size, ShardConfig::default().max_size);
        assert_eq!(config.decode_cache_capacity, 8);

        let defaults: BucketConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, BucketConfig::default());
    }

    #[tokio::test]
    async fn test_bucket_operations() {
        let mut bucket = bucket();
        assert_eq!(bucket.get("a").await.unwrap(), None);
        assert_eq!(bucket.root().await.unwrap(), None);

        bucket.put("a", link("1")).await.unwrap();
        bucket.put("b", link("2")).await.unwrap();
        assert_eq!(bucket.head().len(), 1);
        assert_eq!(bucket.get("a").await.unwrap(), Some(link("1")));

        bucket.del("a").await.unwrap();
        assert_eq!(bucket.get("a").await.unwrap(), None);
        let all = bucket.entries(EntriesOptions::default()).await.unwrap();
        assert_eq!(all, vec![("b".to_string(), link("2"))]);
    }

    #[tokio::test]
    async fn test_bucket_uses_configured_shards() {
        let config = BucketConfig {
            shard: ShardConfig::default().with_max_key_length(4),
            ..BucketConfig::default()
        };
        let mut bucket = Bucket::new(Arc::new(MemoryBlockStore::new()), config);

        let result = bucket.put("aaaaa", link("v")).await.unwrap();
        // empty root, the root holding "aaaa" and the leaf holding "a"
        assert_eq!(result.additions.len(), 3);
        assert_eq!(bucket.get("aaaaa").await.unwrap(), Some(link("v")));
    }

    #[tokio::test]
    async fn test_bucket_batch_and_visualize() {
        let mut bucket = bucket();
        let ops = vec![
            BatchOp::Put {
                key: "x".into(),
                value: link("x"),
            },
            BatchOp::Put {
                key: "y".into(),
                value: link("y"),
            },
        ];
        bucket.batch(ops).await.unwrap();
        assert_eq!(bucket.entries(EntriesOptions::default()).await.unwrap().len(), 2);

        let dot = bucket.visualize().await.unwrap();
        assert!(dot.contains(&format!("  head -> {};", bucket.head()[0])));
    }

    #[test_log::test(tokio::test)]
    async fn test_replicas_converge() {
        let mut alice = bucket();
        alice.put("shared", link("s")).await.unwrap();

        let mut bob = Bucket::load(
            Arc::new(MemoryBlockStore::with_blocks(alice.store().blocks())),
            alice.head().to_vec(),
            BucketConfig::default(),
        );

        alice.put("a", link("a")).await.unwrap();
        bob.put("b", link("b")).await.unwrap();

        alice.import(bob.store().blocks()).await.unwrap();
        bob.import(alice.store().blocks()).await.unwrap();
        let bob_head = bob.head().to_vec();
        let alice_head = alice.head().to_vec();
        alice.merge(&bob_head).await.unwrap();
        bob.merge(&alice_head).await.unwrap();

        assert_eq!(alice.head().len(), 2);
        assert_eq!(alice.root().await.unwrap(), bob.root().await.unwrap());
        for replica in [&alice, &bob] {
            assert_eq!(replica.get("a").await.unwrap(), Some(link("a")));
            assert_eq!(replica.get("b").await.unwrap(), Some(link("b")));
        }
    }
}
