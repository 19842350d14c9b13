//! Error types for the cairn-blockstore crate

use cid::Cid;
use thiserror::Error;

/// Result type alias using `BlockStoreError`
pub type Result<T> = std::result::Result<T, BlockStoreError>;

/// Errors that can occur during block storage operations
#[derive(Error, Debug)]
pub enum BlockStoreError {
    /// Invalid CID
    #[error("invalid CID: {0}")]
    InvalidCid(String),

    /// Block bytes do not hash to the block's CID
    #[error("hash mismatch: data does not match {0}")]
    HashMismatch(Cid),

    /// Backend failure reported by a store implementation
    #[error("backend error: {0}")]
    Backend(String),
}
