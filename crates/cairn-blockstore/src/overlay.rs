//! Layered block fetching
//!
//! Writes produce blocks that callers have not persisted yet. An overlay makes
//! those blocks visible to later reads without touching the base store.

use crate::{Block, BlockFetcher, MemoryBlockStore, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;

/// Reads from an in-memory overlay first, then falls back to a base fetcher
pub struct OverlayBlockFetcher<'a, F: BlockFetcher + ?Sized> {
    overlay: MemoryBlockStore,
    base: &'a F,
}

impl<'a, F: BlockFetcher + ?Sized> OverlayBlockFetcher<'a, F> {
    /// Create an overlay with a fresh, empty scratch store
    pub fn new(base: &'a F) -> Self {
        Self::with_overlay(MemoryBlockStore::new(), base)
    }

    /// Create an overlay around an existing scratch store
    pub fn with_overlay(overlay: MemoryBlockStore, base: &'a F) -> Self {
        Self { overlay, base }
    }

    /// Make a block visible to subsequent reads
    pub fn insert(&self, block: Block) {
        self.overlay.insert(block);
    }

    /// The scratch store holding overlay blocks
    pub fn overlay(&self) -> &MemoryBlockStore {
        &self.overlay
    }

    /// The fetcher reads fall back to
    pub fn base(&self) -> &'a F {
        self.base
    }
}

// clones share the scratch store
impl<F: BlockFetcher + ?Sized> Clone for OverlayBlockFetcher<'_, F> {
    fn clone(&self) -> Self {
        Self {
            overlay: self.overlay.clone(),
            base: self.base,
        }
    }
}

#[async_trait]
impl<F: BlockFetcher + ?Sized> BlockFetcher for OverlayBlockFetcher<'_, F> {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Bytes>> {
        if let Some(data) = self.overlay.get_block(cid).await? {
            return Ok(Some(data));
        }
        self.base.get_block(cid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid_utils::CidCodec;

    #[tokio::test]
    async fn test_overlay_reads_both_layers() {
        let base = MemoryBlockStore::new();
        let below = Block::from_data(b"base".as_slice(), CidCodec::Raw);
        base.insert(below.clone());

        let overlay = OverlayBlockFetcher::new(&base);
        let above = Block::from_data(b"overlay".as_slice(), CidCodec::Raw);
        overlay.insert(above.clone());

        assert_eq!(overlay.get_block(&below.cid).await.unwrap(), Some(below.data));
        assert_eq!(overlay.get_block(&above.cid).await.unwrap(), Some(above.data));
        assert!(!base.contains(&above.cid));
    }

    #[tokio::test]
    async fn test_overlay_clones_share_scratch() {
        let base = MemoryBlockStore::new();
        let overlay = OverlayBlockFetcher::new(&base);
        let clone = overlay.clone();

        let block = Block::from_data(b"later".as_slice(), CidCodec::Raw);
        clone.insert(block.clone());
        assert_eq!(overlay.get_block(&block.cid).await.unwrap(), Some(block.data));
    }

    #[tokio::test]
    async fn test_overlay_missing_everywhere() {
        let base = MemoryBlockStore::new();
        let overlay = OverlayBlockFetcher::new(&base);
        let cid = crate::create_cid(b"nowhere", CidCodec::Raw);

        assert!(overlay.get_block(&cid).await.unwrap().is_none());
    }
}
