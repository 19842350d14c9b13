//! Canonical DAG-CBOR encoding of shards
//!
//! A shard is a map of three fields:
//!
//! ```text
//! { "entries": [[key, value], ...], "maxKeyLength": uint, "maxSize": uint }
//! ```
//!
//! where `value` is a bare data link, `[shard]`, or `[shard, data]`.

use super::{Entry, EntryValue, Shard, ShardBlock, ShardConfig, ShardEntry};
use crate::{CoreError, Result};
use bytes::Bytes;
use cairn_blockstore::{create_cid, CidCodec};
use cid::Cid;
use ipld_core::ipld::Ipld;
use std::collections::BTreeMap;

const ENTRIES: &str = "entries";
const MAX_KEY_LENGTH: &str = "maxKeyLength";
const MAX_SIZE: &str = "maxSize";

/// Encode a shard to its canonical bytes
pub fn encode(shard: &Shard) -> Result<Vec<u8>> {
    serde_ipld_dagcbor::to_vec(&to_ipld(shard)).map_err(|e| CoreError::Serialization(e.to_string()))
}

/// Encode a shard and wrap it with its CID and traversal prefix
pub fn encode_block(shard: Shard, prefix: impl Into<String>) -> Result<ShardBlock> {
    let bytes = Bytes::from(encode(&shard)?);
    let cid = create_cid(&bytes, CidCodec::DagCbor);
    Ok(ShardBlock {
        cid,
        bytes,
        shard,
        prefix: prefix.into(),
    })
}

/// Decode shard bytes, rejecting anything that is not a well-formed shard
pub fn decode(bytes: &[u8]) -> Result<Shard> {
    decode_with_cid(&create_cid(bytes, CidCodec::DagCbor), bytes)
}

/// Decode bytes already known to be addressed by `cid`
pub(crate) fn decode_with_cid(cid: &Cid, bytes: &[u8]) -> Result<Shard> {
    let ipld: Ipld = serde_ipld_dagcbor::from_slice(bytes)
        .map_err(|e| CoreError::invalid_shard(*cid, e.to_string()))?;
    from_ipld(cid, ipld)
}

fn to_ipld(shard: &Shard) -> Ipld {
    let entries = shard
        .entries
        .iter()
        .map(|entry| Ipld::List(vec![Ipld::String(entry.key.clone()), value_to_ipld(&entry.value)]))
        .collect();

    let mut map = BTreeMap::new();
    map.insert(ENTRIES.to_string(), Ipld::List(entries));
    map.insert(MAX_KEY_LENGTH.to_string(), Ipld::Integer(shard.config.max_key_length.into()));
    map.insert(MAX_SIZE.to_string(), Ipld::Integer(shard.config.max_size.into()));
    Ipld::Map(map)
}

fn value_to_ipld(value: &EntryValue) -> Ipld {
    match value {
        EntryValue::Value(data) => Ipld::Link(*data),
        EntryValue::Shard(link) => Ipld::List(vec![Ipld::Link(*link)]),
        EntryValue::ShardAndValue(link, data) => Ipld::List(vec![Ipld::Link(*link), Ipld::Link(*data)]),
    }
}

fn from_ipld(cid: &Cid, ipld: Ipld) -> Result<Shard> {
    let Ipld::Map(mut map) = ipld else {
        return Err(CoreError::invalid_shard(*cid, "expected a map"));
    };

    let config = ShardConfig {
        max_size: take_uint(cid, &mut map, MAX_SIZE)?,
        max_key_length: take_uint(cid, &mut map, MAX_KEY_LENGTH)?,
    };

    let Some(Ipld::List(raw_entries)) = map.remove(ENTRIES) else {
        return Err(CoreError::invalid_shard(*cid, "missing entries list"));
    };

    let mut entries: Vec<ShardEntry> = Vec::with_capacity(raw_entries.len());
    for raw in raw_entries {
        let entry = entry_from_ipld(cid, raw)?;
        if let Some(last) = entries.last() {
            if last.key >= entry.key {
                return Err(CoreError::invalid_shard(
                    *cid,
                    format!("entry {:?} is out of order", entry.key),
                ));
            }
        }
        entries.push(entry);
    }

    Ok(Shard { entries, config })
}

fn take_uint(cid: &Cid, map: &mut BTreeMap<String, Ipld>, field: &str) -> Result<u64> {
    match map.remove(field) {
        Some(Ipld::Integer(n)) => {
            u64::try_from(n).map_err(|_| CoreError::invalid_shard(*cid, format!("{field} out of range")))
        }
        _ => Err(CoreError::invalid_shard(*cid, format!("missing {field}"))),
    }
}

fn entry_from_ipld(cid: &Cid, raw: Ipld) -> Result<ShardEntry> {
    let Ipld::List(pair) = raw else {
        return Err(CoreError::invalid_shard(*cid, "entry is not a list"));
    };
    let [Ipld::String(key), value]: [Ipld; 2] = pair
        .try_into()
        .map_err(|_| CoreError::invalid_shard(*cid, "entry is not a [key, value] pair"))?
    else {
        return Err(CoreError::invalid_shard(*cid, "entry key is not a string"));
    };

    let value = match value {
        Ipld::Link(data) => EntryValue::Value(data),
        Ipld::List(links) => match links.as_slice() {
            [Ipld::Link(link)] => EntryValue::Shard(*link),
            [Ipld::Link(link), Ipld::Link(data)] => EntryValue::ShardAndValue(*link, *data),
            _ => {
                return Err(CoreError::invalid_shard(
                    *cid,
                    format!("malformed shard link for {key:?}"),
                ))
            }
        },
        _ => return Err(CoreError::invalid_shard(*cid, format!("malformed value for {key:?}"))),
    };

    Ok(Entry::new(key, value))
}

/// Byte length of a CBOR head carrying `n`
fn head_len(n: usize) -> usize {
    match n {
        0..=23 => 1,
        24..=0xff => 2,
        0x100..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn text_len(s: &str) -> usize {
    head_len(s.len()) + s.len()
}

/// Length of a tag-42 link given the CID's byte length
fn link_len(cid_len: usize) -> usize {
    // tag 42 head, then a byte string with a leading multibase identity byte
    2 + head_len(cid_len + 1) + cid_len + 1
}

/// Byte length of a binary CID
pub(crate) fn cid_len(cid: &Cid) -> usize {
    cid.to_bytes().len()
}

fn uint_len(n: u64) -> usize {
    usize::try_from(n).map_or(9, head_len)
}

/// Compute the encoded size of a shard without encoding it.
///
/// `shard_cid_len` reports the CID byte length of each child link; values are
/// always stored CIDs.
pub fn entries_encoded_length<L>(
    entries: &[Entry<L>],
    config: &ShardConfig,
    shard_cid_len: impl Fn(&L) -> usize,
) -> usize {
    let entries_len: usize = entries
        .iter()
        .map(|entry| {
            let value = match &entry.value {
                EntryValue::Value(data) => link_len(cid_len(data)),
                EntryValue::Shard(link) => 1 + link_len(shard_cid_len(link)),
                EntryValue::ShardAndValue(link, data) => {
                    1 + link_len(shard_cid_len(link)) + link_len(cid_len(data))
                }
            };
            1 + text_len(&entry.key) + value
        })
        .sum();

    1 + text_len(ENTRIES)
        + head_len(entries.len())
        + entries_len
        + text_len(MAX_KEY_LENGTH)
        + uint_len(config.max_key_length)
        + text_len(MAX_SIZE)
        + uint_len(config.max_size)
}

/// Compute the encoded size of a shard without encoding it
pub fn encoded_length(shard: &Shard) -> usize {
    entries_encoded_length(&shard.entries, &shard.config, cid_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::put_entry;

    fn link(seed: &str) -> Cid {
        create_cid(seed.as_bytes(), CidCodec::Raw)
    }

    fn sample_shard() -> Shard {
        let mut entries = Vec::new();
        put_entry(&mut entries, Entry::new("apple", EntryValue::Value(link("1"))));
        put_entry(&mut entries, Entry::new("b", EntryValue::Shard(link("child"))));
        put_entry(
            &mut entries,
            Entry::new("cherry", EntryValue::ShardAndValue(link("child2"), link("3"))),
        );
        Shard::with_entries(entries, ShardConfig::default())
    }

    #[test]
    fn test_encode_decode() {
        let shard = sample_shard();
        let bytes = encode(&shard).unwrap();
        assert_eq!(decode(&bytes).unwrap(), shard);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = encode_block(sample_shard(), "").unwrap();
        let b = encode_block(sample_shard(), "other prefix").unwrap();
        assert_eq!(a.cid, b.cid);
        assert_eq!(a.bytes, b.bytes);
        assert_eq!(a.cid.codec(), CidCodec::DagCbor.code());
    }

    #[test]
    fn test_config_changes_cid() {
        let a = encode_block(Shard::new(ShardConfig::default()), "").unwrap();
        let b = encode_block(Shard::new(ShardConfig::default().with_max_key_length(4)), "").unwrap();
        assert_ne!(a.cid, b.cid);
    }

    #[test]
    fn test_encoded_length_matches_encoding() {
        let empty = Shard::new(ShardConfig::default());
        assert_eq!(encoded_length(&empty), encode(&empty).unwrap().len());

        let shard = sample_shard();
        assert_eq!(encoded_length(&shard), encode(&shard).unwrap().len());

        let mut big = Shard::new(ShardConfig::default().with_max_size(70_000).with_max_key_length(300));
        for i in 0..40 {
            let key = format!("{}{i:03}", "k".repeat(i * 7));
            put_entry(&mut big.entries, Entry::new(key, EntryValue::Value(link(&i.to_string()))));
        }
        assert_eq!(encoded_length(&big), encode(&big).unwrap().len());
    }

    #[test]
    fn test_decode_rejects_non_shard() {
        let bytes = serde_ipld_dagcbor::to_vec(&Ipld::String("nope".into())).unwrap();
        assert!(matches!(decode(&bytes), Err(CoreError::InvalidShard { .. })));

        let mut map = BTreeMap::new();
        map.insert(ENTRIES.to_string(), Ipld::List(vec![Ipld::Integer(1)]));
        map.insert(MAX_KEY_LENGTH.to_string(), Ipld::Integer(64));
        map.insert(MAX_SIZE.to_string(), Ipld::Integer(1024));
        let bytes = serde_ipld_dagcbor::to_vec(&Ipld::Map(map)).unwrap();
        assert!(matches!(decode(&bytes), Err(CoreError::InvalidShard { .. })));
    }

    #[test]
    fn test_decode_rejects_unsorted_entries() {
        let entry = |key: &str| Ipld::List(vec![Ipld::String(key.into()), Ipld::Link(link(key))]);
        let mut map = BTreeMap::new();
        map.insert(ENTRIES.to_string(), Ipld::List(vec![entry("b"), entry("a")]));
        map.insert(MAX_KEY_LENGTH.to_string(), Ipld::Integer(64));
        map.insert(MAX_SIZE.to_string(), Ipld::Integer(1024));
        let bytes = serde_ipld_dagcbor::to_vec(&Ipld::Map(map)).unwrap();

        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("out of order"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(&[0xff, 0x00, 0x13]), Err(CoreError::InvalidShard { .. })));
    }
}
