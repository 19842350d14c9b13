//! # Cairn Blockstore
//!
//! Content-addressed block storage layer for the Cairn bucket engine.
//!
//! This crate provides:
//! - **Block fetching**: the read-only `BlockFetcher` interface every engine depends on
//! - **Block storage**: put, has, and delete of immutable blocks
//! - **CID generation**: CIDv1 content identifiers over SHA2-256
//! - **Overlays**: layering uncommitted blocks over a base fetcher
//! - **Caching**: In-memory LRU cache for hot blocks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Trie / Clock / CRDT engines      │
//! ├─────────────────────────────────────────┤
//! │           BlockFetcher Trait            │
//! ├─────────────┬─────────────┬─────────────┤
//! │ MemoryStore │ CachedStore │   Overlay   │
//! └─────────────┴─────────────┴─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use cairn_blockstore::{Block, BlockFetcher, BlockStore, CidCodec, MemoryBlockStore};
//!
//! let store = MemoryBlockStore::new();
//! let block = Block::from_data(data, CidCodec::Raw);
//! store.put_block(block.clone()).await?;
//! let retrieved = store.get_block(&block.cid).await?;
//! ```

pub mod block;
pub mod cid_utils;
pub mod error;
pub mod memory;
pub mod overlay;

pub use block::Block;
pub use cid_utils::{compare_cid_bytes, create_cid, CidCodec};
pub use error::{BlockStoreError, Result};
pub use memory::{CachedBlockStore, MemoryBlockStore};
pub use overlay::OverlayBlockFetcher;

pub use cid::Cid;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Read-only access to content-addressed blocks.
///
/// A missing block is reported as `Ok(None)`; errors are reserved for
/// backend failures.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Retrieve the bytes of a block by CID
    async fn get_block(&self, cid: &Cid) -> Result<Option<Bytes>>;
}

/// Trait for writable block storage backends
#[async_trait]
pub trait BlockStore: BlockFetcher {
    /// Store a block under its CID
    async fn put_block(&self, block: Block) -> Result<()>;

    /// Check if a block exists
    async fn has_block(&self, cid: &Cid) -> Result<bool>;

    /// Delete a block
    async fn delete_block(&self, cid: &Cid) -> Result<()>;
}

#[async_trait]
impl<T: BlockFetcher + ?Sized> BlockFetcher for &T {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Bytes>> {
        (**self).get_block(cid).await
    }
}

#[async_trait]
impl<T: BlockFetcher + ?Sized> BlockFetcher for Arc<T> {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Bytes>> {
        (**self).get_block(cid).await
    }
}

#[async_trait]
impl<T: BlockStore + ?Sized> BlockStore for Arc<T> {
    async fn put_block(&self, block: Block) -> Result<()> {
        (**self).put_block(block).await
    }

    async fn has_block(&self, cid: &Cid) -> Result<bool> {
        (**self).has_block(cid).await
    }

    async fn delete_block(&self, cid: &Cid) -> Result<()> {
        (**self).delete_block(cid).await
    }
}
