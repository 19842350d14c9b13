//! Sharded trie operations
//!
//! Every write rewrites the path from the target shard back to the root and
//! reports the blocks it created and made obsolete. Nothing is written to the
//! block store here; callers persist `additions` themselves.

mod entries;

pub use entries::{entries, entries_vec, EntriesOptions};

use crate::shard::{
    encode_block, encoded_length, put_entry, split_entries, split_key, Entry, EntryValue, Shard,
    ShardBlock, ShardConfig, ShardFetcher, SplitError,
};
use crate::{CoreError, Result};
use cairn_blockstore::BlockFetcher;
use cid::Cid;
use tracing::{debug, instrument};

/// Outcome of a trie write
#[derive(Clone, Debug, Default)]
pub struct TrieResult {
    /// Root after the write
    pub root: Cid,
    /// Newly created shards, children before parents
    pub additions: Vec<ShardBlock>,
    /// Shards no longer referenced by the new root
    pub removals: Vec<ShardBlock>,
}

impl TrieResult {
    /// A write that changed nothing
    pub fn unchanged(root: Cid) -> Self {
        Self {
            root,
            additions: Vec::new(),
            removals: Vec::new(),
        }
    }

    /// Whether the write left the trie as it was
    pub fn is_unchanged(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// Shards visited on the way to the shard owning a key
pub(crate) struct Path {
    /// Root first; does not include `target`
    pub ancestors: Vec<ShardBlock>,
    pub target: ShardBlock,
}

/// Put a value for a key, overwriting any existing value
#[instrument(skip_all, fields(%root, key = %key))]
pub async fn put<F: BlockFetcher + ?Sized>(blocks: &F, root: &Cid, key: &str, value: Cid) -> Result<TrieResult> {
    put_with(&ShardFetcher::new(blocks), root, key, value).await
}

/// Get the value stored at a key
#[instrument(skip_all, fields(%root, key = %key))]
pub async fn get<F: BlockFetcher + ?Sized>(blocks: &F, root: &Cid, key: &str) -> Result<Option<Cid>> {
    get_with(&ShardFetcher::new(blocks), root, key).await
}

/// Delete the value stored at a key. Missing keys are a no-op.
#[instrument(skip_all, fields(%root, key = %key))]
pub async fn del<F: BlockFetcher + ?Sized>(blocks: &F, root: &Cid, key: &str) -> Result<TrieResult> {
    del_with(&ShardFetcher::new(blocks), root, key).await
}

pub(crate) async fn put_with<B: BlockFetcher>(
    shards: &ShardFetcher<B>,
    root: &Cid,
    key: &str,
    value: Cid,
) -> Result<TrieResult> {
    let Path { ancestors, target } = traverse(shards, root, key).await?;
    let config = target.shard.config;
    let skey = suffix(key, &target.prefix);

    let mut additions = Vec::new();
    let mut entry = Entry::new(skey, EntryValue::Value(value));
    if config.key_too_long(skey.len()) {
        if let Some((head, chain)) = long_key_chain(skey, &target.prefix, value, config)? {
            additions.extend(chain);
            entry = head;
        }
    }

    let entry_key = entry.key.clone();
    let mut shard = Shard::with_entries(target.shard.entries.clone(), config);
    put_entry(&mut shard.entries, entry);

    if config.too_large(encoded_length(&shard)) {
        let split = split_entries(&mut shard.entries, &entry_key)
            .map_err(|err| split_error(err, &target, key))?;
        let child_prefix = format!("{}{}", target.prefix, split.prefix);
        let child = encode_block(Shard::with_entries(split.entries, config), child_prefix)?;
        debug!(prefix = %child.prefix, child = %child.cid, "split oversized shard");

        let link = match split.value {
            Some(data) => EntryValue::ShardAndValue(child.cid, data),
            None => EntryValue::Shard(child.cid),
        };
        put_entry(&mut shard.entries, Entry::new(split.prefix, link));
        additions.push(child);
    }

    let block = encode_block(shard, target.prefix.clone())?;
    if block.cid == target.cid {
        return Ok(TrieResult::unchanged(*root));
    }

    let mut removals = ancestors.clone();
    removals.push(target);
    propagate(ancestors, block, additions, removals)
}

pub(crate) async fn get_with<B: BlockFetcher>(shards: &ShardFetcher<B>, root: &Cid, key: &str) -> Result<Option<Cid>> {
    let Path { target, .. } = traverse(shards, root, key).await?;
    let skey = suffix(key, &target.prefix);
    Ok(target.shard.get(skey).and_then(|entry| entry.value.value().copied()))
}

pub(crate) async fn del_with<B: BlockFetcher>(shards: &ShardFetcher<B>, root: &Cid, key: &str) -> Result<TrieResult> {
    let Path { mut ancestors, target } = traverse(shards, root, key).await?;
    let skey = suffix(key, &target.prefix);

    let Some(index) = target.shard.entries.iter().position(|entry| entry.key == skey) else {
        return Ok(TrieResult::unchanged(*root));
    };

    let mut entries = target.shard.entries.clone();
    let removed = entries.remove(index);
    let collapse = match removed.value {
        EntryValue::Shard(_) => return Ok(TrieResult::unchanged(*root)),
        EntryValue::ShardAndValue(link, _) => {
            entries.insert(index, Entry::new(removed.key, EntryValue::Shard(link)));
            false
        }
        EntryValue::Value(_) => true,
    };

    let mut shard = Shard::with_entries(entries, target.shard.config);
    let mut prefix = target.prefix.clone();
    let mut removals = ancestors.clone();
    removals.push(target);

    while collapse && shard.is_empty() {
        let Some(parent) = ancestors.pop() else {
            break;
        };
        let link_key = suffix(&prefix, &parent.prefix);
        debug!(prefix = %prefix, parent = %parent.cid, "collapsing empty shard");

        let mut entries = parent.shard.entries;
        if let Some(index) = entries.iter().position(|entry| entry.key == link_key) {
            let entry = entries.remove(index);
            // the parent keeps any value stored at the link key itself
            if let Some(value) = entry.value.without_shard() {
                entries.insert(index, Entry::new(entry.key, value));
            }
        }
        shard = Shard::with_entries(entries, parent.shard.config);
        prefix = parent.prefix;
    }

    let block = encode_block(shard, prefix)?;
    propagate(ancestors, block, Vec::new(), removals)
}

/// Walk from the root to the shard that owns `key`
pub(crate) async fn traverse<B: BlockFetcher>(shards: &ShardFetcher<B>, root: &Cid, key: &str) -> Result<Path> {
    let mut ancestors = Vec::new();
    let mut current = shards.get(root, "").await?;
    loop {
        let skey = suffix(key, &current.prefix);
        let next = child_for(&current.shard, skey).map(|(k, link)| (format!("{}{k}", current.prefix), link));
        match next {
            Some((prefix, link)) => {
                let child = shards.get(&link, prefix).await?;
                ancestors.push(std::mem::replace(&mut current, child));
            }
            None => {
                return Ok(Path {
                    ancestors,
                    target: current,
                })
            }
        }
    }
}

/// The child shard to descend into for `skey`, if any
fn child_for<'a>(shard: &'a Shard, skey: &str) -> Option<(&'a str, Cid)> {
    for entry in &shard.entries {
        if skey <= entry.key.as_str() {
            break;
        }
        if let Some(link) = entry.value.shard() {
            if skey.starts_with(entry.key.as_str()) {
                return Some((&entry.key, *link));
            }
        }
    }
    None
}

/// Build the chain of single-entry shards that holds an over-long key.
///
/// Returns the entry to place in the target shard and the chain blocks,
/// deepest first. `None` if the key cannot be segmented any further.
fn long_key_chain(
    skey: &str,
    prefix: &str,
    value: Cid,
    config: ShardConfig,
) -> Result<Option<(Entry, Vec<ShardBlock>)>> {
    let segments = split_key(skey, config.key_segment_len());
    let Some((last, rest)) = segments.split_last() else {
        return Ok(None);
    };
    let Some((first, middle)) = rest.split_first() else {
        return Ok(None);
    };

    let mut consumed = skey.len() - last.len();
    let mut chain = Vec::with_capacity(segments.len() - 1);
    let leaf = Shard::with_entries(vec![Entry::new(*last, EntryValue::Value(value))], config);
    let mut child = encode_block(leaf, format!("{prefix}{}", &skey[..consumed]))?;

    for segment in middle.iter().rev() {
        consumed -= segment.len();
        let link = Entry::new(*segment, EntryValue::Shard(child.cid));
        let shard = Shard::with_entries(vec![link], config);
        let parent = encode_block(shard, format!("{prefix}{}", &skey[..consumed]))?;
        chain.push(std::mem::replace(&mut child, parent));
    }

    debug!(segments = segments.len(), "created long key chain");
    let head = Entry::new(*first, EntryValue::Shard(child.cid));
    chain.push(child);
    Ok(Some((head, chain)))
}

/// Re-encode ancestors bottom-up so each points at its rewritten child
fn propagate(
    ancestors: Vec<ShardBlock>,
    mut child: ShardBlock,
    mut additions: Vec<ShardBlock>,
    removals: Vec<ShardBlock>,
) -> Result<TrieResult> {
    for parent in ancestors.into_iter().rev() {
        let link_key = suffix(&child.prefix, &parent.prefix).to_string();
        let mut entries = parent.shard.entries;
        let slot = entries
            .iter_mut()
            .find(|entry| entry.key == link_key)
            .and_then(|entry| entry.value.shard_mut())
            .ok_or_else(|| CoreError::invalid_shard(parent.cid, format!("{link_key:?} is not a shard link")))?;
        *slot = child.cid;

        let block = encode_block(Shard::with_entries(entries, parent.shard.config), parent.prefix)?;
        additions.push(std::mem::replace(&mut child, block));
    }

    let root = child.cid;
    additions.push(child);
    Ok(TrieResult {
        root,
        additions,
        removals,
    })
}

pub(crate) fn split_error(err: SplitError, target: &ShardBlock, key: &str) -> CoreError {
    match err {
        SplitError::NoCommonPrefix => CoreError::ShardLimitExceeded {
            key: key.to_string(),
            max_size: target.shard.config.max_size,
        },
        SplitError::PrefixIsShard(prefix) => CoreError::invalid_shard(
            target.cid,
            format!("expected {prefix:?} to hold a value but found a shard link"),
        ),
    }
}

/// The part of `key` below `prefix`
pub(crate) fn suffix<'a>(key: &'a str, prefix: &str) -> &'a str {
    key.strip_prefix(prefix).unwrap_or(key)
}
