//! Block types and operations

use crate::cid_utils::{create_cid, CidCodec};
use bytes::Bytes;
use cid::Cid;

/// A block of data with its CID
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// The content identifier
    pub cid: Cid,
    /// The raw data
    pub data: Bytes,
}

impl Block {
    /// Create a new block
    pub fn new(cid: Cid, data: Bytes) -> Self {
        Self { cid, data }
    }

    /// Create a block from raw bytes (computes CID)
    pub fn from_data(data: impl Into<Bytes>, codec: CidCodec) -> Self {
        let data = data.into();
        let cid = create_cid(&data, codec);
        Self { cid, data }
    }

    /// Get the size of the block
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Check if the block is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the data as a slice
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_from_data() {
        let data = b"Hello, World!";
        let block = Block::from_data(data.as_slice(), CidCodec::Raw);
        assert_eq!(block.size(), data.len());
        assert!(!block.is_empty());
        assert!(crate::cid_utils::verify_cid(block.as_slice(), &block.cid));
    }

    #[test]
    fn test_block_codec_changes_cid() {
        let raw = Block::from_data(b"same".as_slice(), CidCodec::Raw);
        let cbor = Block::from_data(b"same".as_slice(), CidCodec::DagCbor);
        assert_ne!(raw.cid, cbor.cid);
        assert_eq!(raw.data, cbor.data);
    }
}
