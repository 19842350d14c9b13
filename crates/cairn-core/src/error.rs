//! Error types for the cairn-core crate

use cid::Cid;
use thiserror::Error;

/// Result type alias using `CoreError`
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in trie, clock and merge operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// A referenced block is absent from the store
    #[error("missing block: {0}")]
    MissingBlock(Cid),

    /// Decoded bytes are not a well-formed shard
    #[error("invalid shard {cid}: {reason}")]
    InvalidShard { cid: Cid, reason: String },

    /// Decoded bytes are not a well-formed event
    #[error("invalid event {cid}: {reason}")]
    InvalidEvent { cid: Cid, reason: String },

    /// A key/value pair cannot fit in a shard even after prefix splitting
    #[error("shard limit reached: cannot fit key {key:?} within {max_size} bytes")]
    ShardLimitExceeded { key: String, max_size: u64 },

    /// A batch was used after it was committed
    #[error("batch already committed")]
    BatchAlreadyCommitted,

    /// Clock heads share no history
    #[error("failed to find common ancestor event")]
    NoCommonAncestor,

    /// Encoding failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Block store error
    #[error("block store error: {0}")]
    BlockStore(#[from] cairn_blockstore::BlockStoreError),
}

impl CoreError {
    /// Shorthand for a structural shard error
    pub(crate) fn invalid_shard(cid: Cid, reason: impl Into<String>) -> Self {
        CoreError::InvalidShard {
            cid,
            reason: reason.into(),
        }
    }

    /// Shorthand for a structural event error
    pub(crate) fn invalid_event(cid: Cid, reason: impl Into<String>) -> Self {
        CoreError::InvalidEvent {
            cid,
            reason: reason.into(),
        }
    }
}
