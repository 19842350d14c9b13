//! Ordered iteration over trie entries

use crate::shard::{EntryValue, ShardEntry, ShardFetcher};
use crate::Result;
use cairn_blockstore::BlockFetcher;
use cid::Cid;
use futures::stream::{self, Stream, TryStreamExt};

/// Filters and ordering for [`entries`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntriesOptions {
    /// Only keys starting with this prefix
    pub prefix: Option<String>,
    /// Only keys strictly greater than this
    pub gt: Option<String>,
    /// Only keys greater than or equal to this
    pub gte: Option<String>,
    /// Only keys strictly less than this
    pub lt: Option<String>,
    /// Only keys less than or equal to this
    pub lte: Option<String>,
    /// Yield keys in descending order
    pub reverse: bool,
}

impl EntriesOptions {
    /// Options that list every entry in ascending key order
    pub fn new() -> Self {
        Self::default()
    }

    /// Only yield keys starting with `prefix`
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Only yield keys strictly after `key`
    pub fn gt(mut self, key: impl Into<String>) -> Self {
        self.gt = Some(key.into());
        self
    }

    /// Only yield keys at or after `key`
    pub fn gte(mut self, key: impl Into<String>) -> Self {
        self.gte = Some(key.into());
        self
    }

    /// Only yield keys strictly before `key`
    pub fn lt(mut self, key: impl Into<String>) -> Self {
        self.lt = Some(key.into());
        self
    }

    /// Only yield keys at or before `key`
    pub fn lte(mut self, key: impl Into<String>) -> Self {
        self.lte = Some(key.into());
        self
    }

    /// Yield entries in descending key order
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Whether `key` itself should be yielded
    fn matches(&self, key: &str) -> bool {
        self.prefix.as_deref().map_or(true, |p| key.starts_with(p))
            && self.gt.as_deref().map_or(true, |b| key > b)
            && self.gte.as_deref().map_or(true, |b| key >= b)
            && self.lt.as_deref().map_or(true, |b| key < b)
            && self.lte.as_deref().map_or(true, |b| key <= b)
    }

    /// Whether any key strictly extending `key` could be yielded
    fn may_descend(&self, key: &str) -> bool {
        let prefix_ok = self
            .prefix
            .as_deref()
            .map_or(true, |p| key.starts_with(p) || p.starts_with(key));
        // descendants sort after `key`, so an upper bound at or below it excludes them all
        let upper_ok = [&self.lt, &self.lte]
            .into_iter()
            .flatten()
            .all(|bound| key < bound.as_str());
        // a lower bound above `key` is reachable only if it extends `key`
        let lower_ok = [&self.gt, &self.gte]
            .into_iter()
            .flatten()
            .all(|bound| bound.as_str() <= key || bound.starts_with(key));
        prefix_ok && upper_ok && lower_ok
    }
}

enum Pending {
    Shard { link: Cid, prefix: String },
    Entry(String, Cid),
}

struct Walk<B: BlockFetcher> {
    shards: ShardFetcher<B>,
    stack: Vec<Pending>,
    options: EntriesOptions,
}

/// Lazily list `(key, value)` pairs under `root` in key order.
///
/// Shards are fetched only when the walk reaches them and subtrees that
/// cannot satisfy `options` are skipped. Each call starts a fresh walk.
pub fn entries<B: BlockFetcher>(
    blocks: B,
    root: Cid,
    options: EntriesOptions,
) -> impl Stream<Item = Result<(String, Cid)>> + Send {
    let walk = Walk {
        shards: ShardFetcher::new(blocks),
        stack: vec![Pending::Shard {
            link: root,
            prefix: String::new(),
        }],
        options,
    };

    stream::try_unfold(walk, Walk::step)
}

impl<B: BlockFetcher> Walk<B> {
    async fn step(mut self) -> Result<Option<((String, Cid), Self)>> {
        loop {
            match self.stack.pop() {
                None => return Ok(None),
                Some(Pending::Entry(key, value)) => return Ok(Some(((key, value), self))),
                Some(Pending::Shard { link, prefix }) => {
                    let block = self.shards.get(&link, prefix).await?;
                    self.expand(&block.prefix, block.shard.entries);
                }
            }
        }
    }

    /// Queue the entries of a shard so they pop in output order
    fn expand(&mut self, prefix: &str, entries: Vec<ShardEntry>) {
        let mut queued = Vec::with_capacity(entries.len() * 2);
        for entry in entries {
            let key = format!("{prefix}{}", entry.key);
            let (shard, value) = match entry.value {
                EntryValue::Value(value) => (None, Some(value)),
                EntryValue::Shard(link) => (Some(link), None),
                EntryValue::ShardAndValue(link, value) => (Some(link), Some(value)),
            };

            let own = value.filter(|_| self.options.matches(&key));
            let child = shard.filter(|_| self.options.may_descend(&key));
            // ascending order yields a key before its descendants
            if let Some(value) = own {
                queued.push(Pending::Entry(key.clone(), value));
            }
            if let Some(link) = child {
                queued.push(Pending::Shard { link, prefix: key });
            }
        }

        if self.options.reverse {
            // descending: each entry's descendants come before the entry itself
            self.stack.extend(queued);
        } else {
            self.stack.extend(queued.into_iter().rev());
        }
    }
}

/// Collect every entry matching `options`
pub async fn entries_vec<B: BlockFetcher>(
    blocks: B,
    root: Cid,
    options: EntriesOptions,
) -> Result<Vec<(String, Cid)>> {
    entries(blocks, root, options).try_collect().await
}
