//! Many writes recorded as one clock event

use super::{resolve, BatchOp, CrdtResult, Delta, Operation};
use crate::batch::Batch;
use crate::clock::{self, EventBlock};
use crate::shard::{ShardBlock, ShardConfig};
use crate::Result;
use cairn_blockstore::{BlockFetcher, OverlayBlockFetcher};
use cid::Cid;
use tracing::{debug, instrument};

/// A trie batch opened on the effective root of a clock head.
///
/// Commits once, as a single `batch` event parented by the head.
pub struct CrdtBatch<'a, F: BlockFetcher + ?Sized> {
    blocks: OverlayBlockFetcher<'a, F>,
    head: Vec<Cid>,
    batch: Batch<OverlayBlockFetcher<'a, F>>,
    /// Shards produced before the batch opened
    base: Delta,
    ops: Vec<BatchOp>,
}

impl<'a, F: BlockFetcher + ?Sized> CrdtBatch<'a, F> {
    /// Open a batch on `head`; an empty head starts with a default empty shard
    pub async fn open(blocks: &'a F, head: &[Cid]) -> Result<Self> {
        Self::open_with_config(blocks, head, ShardConfig::default()).await
    }

    /// Open a batch on `head`, using `config` if the head is empty
    #[instrument(skip_all, fields(head = head.len()))]
    pub async fn open_with_config(blocks: &'a F, head: &[Cid], config: ShardConfig) -> Result<Self> {
        let blocks = OverlayBlockFetcher::new(blocks);

        let (root, base) = if head.is_empty() {
            let empty = ShardBlock::create(config)?;
            blocks.insert(empty.to_block());
            let root = empty.cid;
            let mut base = Delta::default();
            base.add(&empty);
            (root, base)
        } else {
            resolve::effective_root(&blocks, head).await?
        };

        let batch = Batch::open(blocks.clone(), &root).await?;
        Ok(Self {
            blocks,
            head: head.to_vec(),
            batch,
            base,
            ops: Vec::new(),
        })
    }

    /// Head the batch was opened on
    pub fn head(&self) -> &[Cid] {
        &self.head
    }

    /// Queue a put
    pub async fn put(&mut self, key: &str, value: Cid) -> Result<()> {
        self.batch.put(key, value).await?;
        self.ops.push(BatchOp::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Queue a delete
    pub async fn del(&mut self, key: &str) -> Result<()> {
        self.batch.del(key).await?;
        self.ops.push(BatchOp::Del { key: key.to_string() });
        Ok(())
    }

    /// Commit the queued writes as one event and advance the head.
    ///
    /// Writes that leave the root unchanged create no event.
    #[instrument(skip(self), fields(ops = self.ops.len()))]
    pub async fn commit(&mut self) -> Result<CrdtResult> {
        let result = self.batch.commit()?;
        let base_root = *self.batch.base_root();
        let mut delta = std::mem::take(&mut self.base);

        if result.root == base_root {
            debug!(root = %base_root, "batch left the root unchanged");
            let resolved = if self.head.is_empty() { Delta::default() } else { delta };
            return Ok(super::into_result(resolved.finish(base_root), self.head.clone(), None));
        }

        delta.absorb(&result);
        let ops = std::mem::take(&mut self.ops);
        let event = EventBlock::create(Operation::Batch { ops, root: result.root }, &self.head)?;
        self.blocks.insert(event.to_block());
        let head = clock::advance(&self.blocks, &self.head, &event.cid).await?;

        Ok(super::into_result(delta.finish(result.root), head, Some(event)))
    }
}
