//! Batched trie writes
//!
//! A batch mirrors the touched part of the trie as an arena of mutable nodes.
//! Child shards are loaded only when a key routes through them, and every
//! touched node is encoded once at commit. Applying operations through a batch
//! yields the same root as applying them one by one through [`crate::trie`].

use crate::shard::{
    cid_len, encode_block, entries_encoded_length, put_entry, split_entries, split_key, Entry,
    EntryValue, Shard, ShardBlock, ShardConfig, ShardFetcher, SplitError,
};
use crate::trie::{suffix, TrieResult};
use crate::{CoreError, Result};
use cairn_blockstore::cid_utils::SHA256_CID_LENGTH;
use cairn_blockstore::BlockFetcher;
use cid::Cid;
use std::collections::HashSet;
use tracing::{debug, instrument};

/// Where a batch entry's child shard lives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChildRef {
    /// Untouched shard in the block store
    Stored(Cid),
    /// Node in the batch arena
    Node(usize),
}

#[derive(Debug)]
struct BatchNode {
    /// Shard this node was loaded from; `None` for nodes created in the batch
    base: Option<ShardBlock>,
    prefix: String,
    entries: Vec<Entry<ChildRef>>,
    config: ShardConfig,
}

impl BatchNode {
    fn from_block(block: ShardBlock) -> Self {
        let entries = block
            .shard
            .entries
            .iter()
            .map(|entry| Entry::new(entry.key.clone(), entry.value.clone().map_shard(ChildRef::Stored)))
            .collect();
        Self {
            prefix: block.prefix.clone(),
            config: block.shard.config,
            entries,
            base: Some(block),
        }
    }

    fn encoded_length(&self) -> usize {
        entries_encoded_length(&self.entries, &self.config, |child| match child {
            ChildRef::Stored(cid) => cid_len(cid),
            // not encoded yet; every shard link is a sha2-256 dag-cbor CID
            ChildRef::Node(_) => SHA256_CID_LENGTH,
        })
    }
}

/// An open batch of trie writes against a single root
pub struct Batch<B: BlockFetcher> {
    shards: ShardFetcher<B>,
    root: Cid,
    nodes: Vec<BatchNode>,
    /// Loaded shards that were emptied and unlinked
    dropped: Vec<ShardBlock>,
    committed: bool,
}

const ROOT: usize = 0;

impl<B: BlockFetcher> Batch<B> {
    /// Open a batch on top of `root`
    pub async fn open(blocks: B, root: &Cid) -> Result<Self> {
        let shards = ShardFetcher::new(blocks);
        let base = shards.get(root, "").await?;
        Ok(Self {
            shards,
            root: *root,
            nodes: vec![BatchNode::from_block(base)],
            dropped: Vec::new(),
            committed: false,
        })
    }

    /// Root the batch was opened on
    pub fn base_root(&self) -> &Cid {
        &self.root
    }

    /// Whether [`Batch::commit`] has been called
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Queue a put of `value` at `key`
    pub async fn put(&mut self, key: &str, value: Cid) -> Result<()> {
        self.ensure_open()?;
        let (path, skey) = self.traverse(key).await?;
        let Some(&target) = path.last() else {
            return Ok(());
        };
        let config = self.nodes[target].config;

        let mut entry = Entry::new(skey.as_str(), EntryValue::Value(value));
        if config.key_too_long(skey.len()) {
            if let Some(head) = self.long_key_chain(target, &skey, value) {
                entry = head;
            }
        }

        let entry_key = entry.key.clone();
        put_entry(&mut self.nodes[target].entries, entry);

        if config.too_large(self.nodes[target].encoded_length()) {
            let split = split_entries(&mut self.nodes[target].entries, &entry_key)
                .map_err(|err| self.split_error(err, target, key))?;
            let prefix = format!("{}{}", self.nodes[target].prefix, split.prefix);
            debug!(prefix = %prefix, "split oversized batch node");
            let child = self.push(BatchNode {
                base: None,
                prefix,
                entries: split.entries,
                config,
            });

            let link = match split.value {
                Some(data) => EntryValue::ShardAndValue(ChildRef::Node(child), data),
                None => EntryValue::Shard(ChildRef::Node(child)),
            };
            put_entry(&mut self.nodes[target].entries, Entry::new(split.prefix, link));
        }

        Ok(())
    }

    /// Queue a delete of `key`. Missing keys and bare shard links are ignored.
    pub async fn del(&mut self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let (path, skey) = self.traverse(key).await?;
        let Some(&target) = path.last() else {
            return Ok(());
        };

        let entries = &mut self.nodes[target].entries;
        let Some(index) = entries.iter().position(|entry| entry.key == skey) else {
            return Ok(());
        };
        match entries[index].value {
            EntryValue::Shard(_) => return Ok(()),
            EntryValue::ShardAndValue(child, _) => {
                entries[index].value = EntryValue::Shard(child);
                return Ok(());
            }
            EntryValue::Value(_) => {
                entries.remove(index);
            }
        }

        for pair in path.windows(2).rev() {
            let (parent, child) = (pair[0], pair[1]);
            if !self.nodes[child].entries.is_empty() {
                break;
            }

            let link_key = suffix(&self.nodes[child].prefix, &self.nodes[parent].prefix).to_string();
            debug!(prefix = %self.nodes[child].prefix, "collapsing empty batch node");
            if let Some(base) = self.nodes[child].base.take() {
                self.dropped.push(base);
            }

            let entries = &mut self.nodes[parent].entries;
            if let Some(index) = entries.iter().position(|entry| entry.key == link_key) {
                let entry = entries.remove(index);
                if let Some(value) = entry.value.without_shard() {
                    entries.insert(index, Entry::new(entry.key, value));
                }
            }
        }

        Ok(())
    }

    /// Encode every touched node and return the new root.
    ///
    /// A batch commits at most once.
    #[instrument(skip(self), fields(root = %self.root))]
    pub fn commit(&mut self) -> Result<TrieResult> {
        self.ensure_open()?;
        self.committed = true;

        let mut additions = Vec::new();
        let mut removals = Vec::new();
        let root = self.commit_node(ROOT, &mut additions, &mut removals)?;
        removals.append(&mut self.dropped);

        // a block both created and dropped within the batch is neither
        let added: HashSet<Cid> = additions.iter().map(|block| block.cid).collect();
        let removed: HashSet<Cid> = removals.iter().map(|block| block.cid).collect();
        additions.retain(|block| !removed.contains(&block.cid));
        removals.retain(|block| !added.contains(&block.cid));

        debug!(%root, additions = additions.len(), removals = removals.len(), "committed batch");
        Ok(TrieResult {
            root,
            additions,
            removals,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.committed {
            return Err(CoreError::BatchAlreadyCommitted);
        }
        Ok(())
    }

    fn push(&mut self, node: BatchNode) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Route `key` to the node that owns it, loading stored shards on the way.
    ///
    /// Returns the node path from the root and the key suffix in the last node.
    async fn traverse(&mut self, key: &str) -> Result<(Vec<usize>, String)> {
        let mut path = vec![ROOT];
        let mut node = ROOT;
        let mut skey = key.to_string();

        loop {
            let found = self.nodes[node].entries.iter().enumerate().find_map(|(i, entry)| {
                if skey.as_str() <= entry.key.as_str() {
                    return Some(None);
                }
                match entry.value.shard() {
                    Some(child) if skey.starts_with(entry.key.as_str()) => Some(Some((i, *child))),
                    _ => None,
                }
            });
            let Some(Some((index, child))) = found else {
                return Ok((path, skey));
            };

            let link_key = self.nodes[node].entries[index].key.clone();
            let child = match child {
                ChildRef::Node(child) => child,
                ChildRef::Stored(cid) => {
                    let prefix = format!("{}{link_key}", self.nodes[node].prefix);
                    let block = self.shards.get(&cid, prefix).await?;
                    let child = self.push(BatchNode::from_block(block));
                    if let Some(slot) = self.nodes[node].entries[index].value.shard_mut() {
                        *slot = ChildRef::Node(child);
                    }
                    child
                }
            };

            skey = skey[link_key.len()..].to_string();
            path.push(child);
            node = child;
        }
    }

    /// Create the chain of single-entry nodes holding an over-long key and
    /// return the entry linking it from `target`
    fn long_key_chain(&mut self, target: usize, skey: &str, value: Cid) -> Option<Entry<ChildRef>> {
        let config = self.nodes[target].config;
        let prefix = self.nodes[target].prefix.clone();
        let segments = split_key(skey, config.key_segment_len());
        let (last, rest) = segments.split_last()?;
        let (first, middle) = rest.split_first()?;

        let mut consumed = skey.len() - last.len();
        let mut child = self.push(BatchNode {
            base: None,
            prefix: format!("{prefix}{}", &skey[..consumed]),
            entries: vec![Entry::new(*last, EntryValue::Value(value))],
            config,
        });
        for segment in middle.iter().rev() {
            consumed -= segment.len();
            child = self.push(BatchNode {
                base: None,
                prefix: format!("{prefix}{}", &skey[..consumed]),
                entries: vec![Entry::new(*segment, EntryValue::Shard(ChildRef::Node(child)))],
                config,
            });
        }

        Some(Entry::new(*first, EntryValue::Shard(ChildRef::Node(child))))
    }

    fn commit_node(&self, index: usize, additions: &mut Vec<ShardBlock>, removals: &mut Vec<ShardBlock>) -> Result<Cid> {
        let node = &self.nodes[index];
        let mut entries = Vec::with_capacity(node.entries.len());
        for entry in &node.entries {
            let value = match &entry.value {
                EntryValue::Value(data) => EntryValue::Value(*data),
                EntryValue::Shard(child) => EntryValue::Shard(self.commit_child(child, additions, removals)?),
                EntryValue::ShardAndValue(child, data) => {
                    EntryValue::ShardAndValue(self.commit_child(child, additions, removals)?, *data)
                }
            };
            entries.push(Entry::new(entry.key.clone(), value));
        }

        let block = encode_block(Shard::with_entries(entries, node.config), node.prefix.clone())?;
        let cid = block.cid;
        match &node.base {
            Some(base) if base.cid == cid => {}
            Some(base) => {
                removals.push(base.clone());
                additions.push(block);
            }
            None => additions.push(block),
        }
        Ok(cid)
    }

    fn commit_child(&self, child: &ChildRef, additions: &mut Vec<ShardBlock>, removals: &mut Vec<ShardBlock>) -> Result<Cid> {
        match child {
            ChildRef::Stored(cid) => Ok(*cid),
            ChildRef::Node(index) => self.commit_node(*index, additions, removals),
        }
    }

    fn split_error(&self, err: SplitError, node: usize, key: &str) -> CoreError {
        match err {
            SplitError::NoCommonPrefix => CoreError::ShardLimitExceeded {
                key: key.to_string(),
                max_size: self.nodes[node].config.max_size,
            },
            SplitError::PrefixIsShard(prefix) => {
                let cid = self.nodes[node].base.as_ref().map_or(self.root, |base| base.cid);
                CoreError::invalid_shard(cid, format!("expected {prefix:?} to hold a value but found a shard link"))
            }
        }
    }
}
