//! Shards: the immutable trie nodes of a bucket
//!
//! A shard holds a sorted list of `(key suffix, value)` entries. A value is a
//! link to application data, a link to a child shard holding longer keys that
//! share the suffix as a prefix, or both at once.

mod codec;
mod fetcher;

pub use codec::{decode, encode, encode_block, encoded_length, entries_encoded_length};
pub(crate) use codec::{cid_len, decode_with_cid};
pub use fetcher::{ShardFetcher, DEFAULT_DECODE_CACHE};

use bytes::Bytes;
use cairn_blockstore::Block;
use cid::Cid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default maximum byte length of a key segment stored directly in a shard
pub const MAX_KEY_LENGTH: u64 = 64;

/// Default maximum encoded byte length of a shard
pub const MAX_SHARD_SIZE: u64 = 512 * 1024;

/// Size limits persisted in every shard and inherited by its children
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShardConfig {
    /// Maximum encoded byte length of a shard
    pub max_size: u64,
    /// Maximum byte length of a key segment in a single shard
    pub max_key_length: u64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            max_size: MAX_SHARD_SIZE,
            max_key_length: MAX_KEY_LENGTH,
        }
    }
}

impl ShardConfig {
    /// Override the maximum shard size
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Override the maximum key segment length
    pub fn with_max_key_length(mut self, max_key_length: u64) -> Self {
        self.max_key_length = max_key_length;
        self
    }

    /// Whether a key segment of `len` bytes must be split into a chain
    pub(crate) fn key_too_long(&self, len: usize) -> bool {
        u64::try_from(len).map_or(true, |len| len > self.max_key_length)
    }

    /// Whether a shard of `len` encoded bytes must be split
    pub(crate) fn too_large(&self, len: usize) -> bool {
        u64::try_from(len).map_or(true, |len| len > self.max_size)
    }

    pub(crate) fn key_segment_len(&self) -> usize {
        usize::try_from(self.max_key_length).unwrap_or(usize::MAX)
    }
}

/// The value slot of a shard entry.
///
/// `L` is the representation of a child shard: a persisted [`Cid`] for
/// encoded shards, or an in-memory node reference inside a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryValue<L = Cid> {
    /// Link to application data
    Value(Cid),
    /// Link to a child shard
    Shard(L),
    /// Link to a child shard and to the data stored at this exact key
    ShardAndValue(L, Cid),
}

impl<L> EntryValue<L> {
    /// The data link, if this entry carries one
    pub fn value(&self) -> Option<&Cid> {
        match self {
            EntryValue::Value(value) | EntryValue::ShardAndValue(_, value) => Some(value),
            EntryValue::Shard(_) => None,
        }
    }

    /// The child shard, if this entry carries one
    pub fn shard(&self) -> Option<&L> {
        match self {
            EntryValue::Shard(link) | EntryValue::ShardAndValue(link, _) => Some(link),
            EntryValue::Value(_) => None,
        }
    }

    /// Mutable access to the child shard
    pub fn shard_mut(&mut self) -> Option<&mut L> {
        match self {
            EntryValue::Shard(link) | EntryValue::ShardAndValue(link, _) => Some(link),
            EntryValue::Value(_) => None,
        }
    }

    /// Whether this entry links to a child shard
    pub fn is_shard(&self) -> bool {
        self.shard().is_some()
    }

    /// Combine an existing slot with an incoming one.
    ///
    /// Writing a data link over a shard keeps the shard; writing a shard link
    /// over data keeps the data. Only a full link+value write replaces both.
    pub fn merge(self, incoming: EntryValue<L>) -> EntryValue<L> {
        match (self, incoming) {
            (EntryValue::Shard(link) | EntryValue::ShardAndValue(link, _), EntryValue::Value(value)) => {
                EntryValue::ShardAndValue(link, value)
            }
            (EntryValue::Value(_), EntryValue::Value(value)) => EntryValue::Value(value),
            (EntryValue::Value(value) | EntryValue::ShardAndValue(_, value), EntryValue::Shard(link)) => {
                EntryValue::ShardAndValue(link, value)
            }
            (EntryValue::Shard(_), EntryValue::Shard(link)) => EntryValue::Shard(link),
            (_, both @ EntryValue::ShardAndValue(..)) => both,
        }
    }

    /// Drop the data link, keeping any child shard
    pub fn without_value(self) -> Option<EntryValue<L>> {
        match self {
            EntryValue::Value(_) => None,
            EntryValue::Shard(link) | EntryValue::ShardAndValue(link, _) => Some(EntryValue::Shard(link)),
        }
    }

    /// Drop the child shard, keeping any data link
    pub fn without_shard(self) -> Option<EntryValue<L>> {
        match self {
            EntryValue::Shard(_) => None,
            EntryValue::Value(value) | EntryValue::ShardAndValue(_, value) => Some(EntryValue::Value(value)),
        }
    }

    /// Swap the child shard representation, keeping any data link
    pub fn map_shard<M>(self, f: impl FnOnce(L) -> M) -> EntryValue<M> {
        match self {
            EntryValue::Value(value) => EntryValue::Value(value),
            EntryValue::Shard(link) => EntryValue::Shard(f(link)),
            EntryValue::ShardAndValue(link, value) => EntryValue::ShardAndValue(f(link), value),
        }
    }
}

/// A single key suffix and its value slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry<L = Cid> {
    /// Key suffix relative to the shard's prefix
    pub key: String,
    /// Value slot
    pub value: EntryValue<L>,
}

impl<L> Entry<L> {
    /// Create a new entry
    pub fn new(key: impl Into<String>, value: EntryValue<L>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// An entry of an encoded shard
pub type ShardEntry = Entry<Cid>;

/// The logical content of a shard
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Shard {
    /// Entries in strictly ascending key order
    pub entries: Vec<ShardEntry>,
    /// Size limits
    pub config: ShardConfig,
}

impl Shard {
    /// Create an empty shard
    pub fn new(config: ShardConfig) -> Self {
        Self {
            entries: Vec::new(),
            config,
        }
    }

    /// Create a shard from already sorted entries
    pub fn with_entries(entries: Vec<ShardEntry>, config: ShardConfig) -> Self {
        Self { entries, config }
    }

    /// Find an entry by exact key suffix
    pub fn get(&self, key: &str) -> Option<&ShardEntry> {
        self.entries
            .binary_search_by(|entry| entry.key.as_str().cmp(key))
            .ok()
            .map(|index| &self.entries[index])
    }

    /// Check if the shard has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// An encoded shard together with the key prefix it was reached by
#[derive(Clone, PartialEq, Eq)]
pub struct ShardBlock {
    /// Content identifier of the encoded bytes
    pub cid: Cid,
    /// Canonical DAG-CBOR bytes
    pub bytes: Bytes,
    /// Decoded content
    pub shard: Shard,
    /// Concatenation of keys traversed from the root; never persisted
    pub prefix: String,
}

impl ShardBlock {
    /// Encode an empty root shard
    pub fn create(config: ShardConfig) -> crate::Result<Self> {
        encode_block(Shard::new(config), "")
    }

    /// Convert into a storable block
    pub fn to_block(&self) -> Block {
        Block::new(self.cid, self.bytes.clone())
    }
}

impl From<&ShardBlock> for Block {
    fn from(block: &ShardBlock) -> Self {
        block.to_block()
    }
}

impl fmt::Debug for ShardBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardBlock")
            .field("cid", &self.cid.to_string())
            .field("prefix", &self.prefix)
            .field("entries", &self.shard.entries.len())
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Insert or update an entry, keeping entries sorted by key.
///
/// Colliding keys are combined with [`EntryValue::merge`].
pub fn put_entry<L>(entries: &mut Vec<Entry<L>>, entry: Entry<L>) {
    match entries.binary_search_by(|e| e.key.as_str().cmp(entry.key.as_str())) {
        Ok(index) => {
            let existing = entries.remove(index);
            let value = existing.value.merge(entry.value);
            entries.insert(index, Entry::new(entry.key, value));
        }
        Err(index) => entries.insert(index, entry),
    }
}

/// The entries chosen to move into a new child shard
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommonPrefix {
    /// Shared key prefix; becomes the key of the new shard link
    pub prefix: String,
    /// Indices of every entry whose key starts with `prefix`
    pub matches: Vec<usize>,
}

/// Find the longest prefix shared by at least two entries, searching outward
/// from the entry keyed `key`.
///
/// Each candidate entry contributes its key minus one trailing character,
/// shrinking a character at a time until at least two entries match. Returns
/// `None` when no two entries share any prefix.
pub fn find_common_prefix<L>(entries: &[Entry<L>], key: &str) -> Option<CommonPrefix> {
    let start = entries.iter().position(|entry| entry.key == key)?;
    let mut index = start;
    loop {
        let mut prefix = pop_char(&entries[index].key);
        while !prefix.is_empty() {
            let matches: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.key.starts_with(prefix))
                .map(|(i, _)| i)
                .collect();
            if matches.len() > 1 {
                return Some(CommonPrefix {
                    prefix: prefix.to_string(),
                    matches,
                });
            }
            prefix = pop_char(prefix);
        }
        index = (index + 1) % entries.len();
        if index == start {
            return None;
        }
    }
}

/// Entries factored out of an oversized shard
#[derive(Debug)]
pub(crate) struct Split<L> {
    /// Key of the new shard link in the parent
    pub prefix: String,
    /// Child entries with `prefix` stripped from their keys
    pub entries: Vec<Entry<L>>,
    /// Data previously stored at exactly `prefix`
    pub value: Option<Cid>,
}

#[derive(Debug)]
pub(crate) enum SplitError {
    /// No two entries share a prefix
    NoCommonPrefix,
    /// The entry at the common prefix is already a shard link
    PrefixIsShard(String),
}

/// Remove the entries sharing the longest common prefix near `key`.
///
/// On error `entries` is left untouched.
pub(crate) fn split_entries<L>(
    entries: &mut Vec<Entry<L>>,
    key: &str,
) -> std::result::Result<Split<L>, SplitError> {
    let CommonPrefix { prefix, matches } =
        find_common_prefix(entries, key).ok_or(SplitError::NoCommonPrefix)?;

    if let Some(existing) = matches.iter().map(|&i| &entries[i]).find(|e| e.key == prefix) {
        if existing.value.is_shard() {
            return Err(SplitError::PrefixIsShard(prefix));
        }
    }

    let mut value = None;
    let mut moved = Vec::with_capacity(matches.len());
    // matches are ascending, so removing from the back keeps indices valid
    for index in matches.into_iter().rev() {
        let entry = entries.remove(index);
        match entry.key.strip_prefix(prefix.as_str()) {
            Some("") => value = entry.value.value().copied(),
            Some(rest) => moved.push(Entry::new(rest, entry.value)),
            None => {}
        }
    }
    moved.reverse();

    Ok(Split {
        prefix,
        entries: moved,
        value,
    })
}

/// Split a key into consecutive segments of at most `max_len` bytes.
///
/// Segments end on character boundaries; a segment always holds at least one
/// character even if that character alone exceeds `max_len`.
pub fn split_key(key: &str, max_len: usize) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut rest = key;
    while !rest.is_empty() {
        let mut end = max_len.min(rest.len());
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (segment, tail) = rest.split_at(end);
        segments.push(segment);
        rest = tail;
    }
    segments
}

fn pop_char(s: &str) -> &str {
    s.char_indices().next_back().map_or("", |(i, _)| &s[..i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_blockstore::{create_cid, CidCodec};

    fn link(seed: &str) -> Cid {
        create_cid(seed.as_bytes(), CidCodec::Raw)
    }

    fn value_entry(key: &str, seed: &str) -> ShardEntry {
        Entry::new(key, EntryValue::Value(link(seed)))
    }

    #[test]
    fn test_put_entry_keeps_order() {
        let mut entries = Vec::new();
        put_entry(&mut entries, value_entry("c", "3"));
        put_entry(&mut entries, value_entry("a", "1"));
        put_entry(&mut entries, value_entry("b", "2"));

        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_put_entry_overwrites_value() {
        let mut entries = vec![value_entry("a", "1")];
        put_entry(&mut entries, value_entry("a", "2"));

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, EntryValue::Value(link("2")));
    }

    #[test]
    fn test_put_entry_value_over_shard_keeps_shard() {
        let mut entries = vec![Entry::new("a", EntryValue::Shard(link("child")))];
        put_entry(&mut entries, value_entry("a", "v"));

        assert_eq!(entries[0].value, EntryValue::ShardAndValue(link("child"), link("v")));
    }

    #[test]
    fn test_put_entry_shard_over_value_keeps_value() {
        let mut entries = vec![value_entry("a", "v")];
        put_entry(&mut entries, Entry::new("a", EntryValue::Shard(link("child"))));

        assert_eq!(entries[0].value, EntryValue::ShardAndValue(link("child"), link("v")));

        put_entry(&mut entries, Entry::new("a", EntryValue::Shard(link("other"))));
        assert_eq!(entries[0].value, EntryValue::ShardAndValue(link("other"), link("v")));
    }

    #[test]
    fn test_find_common_prefix() {
        let entries = vec![
            value_entry("aaaa", "1"),
            value_entry("aabb", "2"),
            value_entry("bbbb", "3"),
        ];

        let common = find_common_prefix(&entries, "aabb").unwrap();
        assert_eq!(common.prefix, "aa");
        assert_eq!(common.matches, vec![0, 1]);
    }

    #[test]
    fn test_find_common_prefix_wraps_around() {
        let entries = vec![
            value_entry("aaaa", "1"),
            value_entry("aaab", "2"),
            value_entry("z", "3"),
        ];

        let common = find_common_prefix(&entries, "z").unwrap();
        assert_eq!(common.prefix, "aaa");
        assert_eq!(common.matches, vec![0, 1]);
    }

    #[test]
    fn test_find_common_prefix_none() {
        let entries = vec![value_entry("a", "1"), value_entry("b", "2")];
        assert!(find_common_prefix(&entries, "a").is_none());
        assert!(find_common_prefix(&entries, "missing").is_none());
    }

    #[test]
    fn test_split_entries_moves_matches() {
        let mut entries = vec![
            value_entry("aa", "0"),
            value_entry("aab", "1"),
            value_entry("aac", "2"),
            value_entry("b", "3"),
        ];

        let split = split_entries(&mut entries, "aac").unwrap();
        assert_eq!(split.prefix, "aa");
        assert_eq!(split.value, Some(link("0")));
        let moved: Vec<_> = split.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(moved, vec!["b", "c"]);
        let kept: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(kept, vec!["b"]);
    }

    #[test]
    fn test_split_entries_rejects_shard_at_prefix() {
        let mut entries = vec![
            Entry::new("aa", EntryValue::Shard(link("child"))),
            value_entry("aab", "1"),
        ];

        assert!(matches!(
            split_entries(&mut entries, "aab"),
            Err(SplitError::PrefixIsShard(prefix)) if prefix == "aa"
        ));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("aaaaa", 4), vec!["aaaa", "a"]);
        assert_eq!(split_key("abcdefgh", 4), vec!["abcd", "efgh"]);
        assert_eq!(split_key("ab", 4), vec!["ab"]);
        // "é" is two bytes and must not be cut in half
        assert_eq!(split_key("aéb", 2), vec!["a", "é", "b"]);
    }

    #[test]
    fn test_entry_value_accessors() {
        let both: EntryValue = EntryValue::ShardAndValue(link("s"), link("v"));
        assert_eq!(both.value(), Some(&link("v")));
        assert_eq!(both.shard(), Some(&link("s")));
        assert_eq!(both.clone().without_value(), Some(EntryValue::Shard(link("s"))));
        assert_eq!(both.without_shard(), Some(EntryValue::Value(link("v"))));

        let data: EntryValue = EntryValue::Value(link("v"));
        assert!(!data.is_shard());
        assert_eq!(data.without_value(), None);
    }

    #[test]
    fn test_shard_config_from_json() {
        let config: ShardConfig = serde_json::from_str(r#"{"maxKeyLength": 4}"#).unwrap();
        assert_eq!(config.max_key_length, 4);
        assert_eq!(config.max_size, MAX_SHARD_SIZE);
    }
}
