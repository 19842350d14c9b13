//! CID (Content Identifier) utilities
//!
//! Creates CIDv1 content identifiers over a SHA2-256 multihash

use cid::{Cid, Version};
use multihash_codetable::{Code, MultihashDigest};
use std::cmp::Ordering;

/// Byte length of a CIDv1 with a one-byte codec and a SHA2-256 multihash.
pub const SHA256_CID_LENGTH: usize = 36;

/// Supported IPLD codecs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CidCodec {
    /// Raw binary data (0x55)
    #[default]
    Raw,
    /// DAG-CBOR (0x71)
    DagCbor,
}

impl CidCodec {
    /// Get the multicodec code
    pub fn code(&self) -> u64 {
        match self {
            CidCodec::Raw => 0x55,
            CidCodec::DagCbor => 0x71,
        }
    }

    /// Parse from multicodec code
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0x55 => Some(CidCodec::Raw),
            0x71 => Some(CidCodec::DagCbor),
            _ => None,
        }
    }

    /// Get a human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CidCodec::Raw => "raw",
            CidCodec::DagCbor => "dag-cbor",
        }
    }
}

/// Create a CIDv1 from data using a SHA2-256 multihash
pub fn create_cid(data: &[u8], codec: CidCodec) -> Cid {
    let multihash = Code::Sha2_256.digest(data);
    Cid::new_v1(codec.code(), multihash)
}

/// Verify that data matches a CID
pub fn verify_cid(data: &[u8], cid: &Cid) -> bool {
    if cid.version() != Version::V1 {
        return false;
    }
    match CidCodec::from_code(cid.codec()) {
        Some(codec) => create_cid(data, codec) == *cid,
        None => false,
    }
}

/// Parse a CID from a string
pub fn parse_cid(s: &str) -> Result<Cid, crate::BlockStoreError> {
    s.parse()
        .map_err(|e: cid::Error| crate::BlockStoreError::InvalidCid(e.to_string()))
}

/// Get the codec of a CID
pub fn get_codec(cid: &Cid) -> Option<CidCodec> {
    CidCodec::from_code(cid.codec())
}

/// Total order over CIDs by their binary form.
///
/// Used wherever a set of links must be laid out canonically before encoding.
pub fn compare_cid_bytes(a: &Cid, b: &Cid) -> Ordering {
    a.to_bytes().cmp(&b.to_bytes())
}
