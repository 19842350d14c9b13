//! Structural difference between two trie roots

use crate::shard::{EntryValue, ShardBlock, ShardFetcher};
use crate::Result;
use cairn_blockstore::BlockFetcher;
use cid::Cid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::instrument;

/// Type of change in a diff
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    /// Key was added
    Add,
    /// Key was removed
    Remove,
    /// Value was modified
    Modify,
}

/// A key whose value differs between two roots
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChange {
    /// The key that changed
    pub key: String,
    /// Type of change
    pub change_type: ChangeType,
    /// Value under the first root
    pub before: Option<Cid>,
    /// Value under the second root
    pub after: Option<Cid>,
}

impl KeyChange {
    /// Create a change, or `None` when both sides agree
    pub fn new(key: impl Into<String>, before: Option<Cid>, after: Option<Cid>) -> Option<Self> {
        let change_type = match (&before, &after) {
            (None, Some(_)) => ChangeType::Add,
            (Some(_), None) => ChangeType::Remove,
            (Some(old), Some(new)) if old != new => ChangeType::Modify,
            _ => return None,
        };
        Some(Self {
            key: key.into(),
            change_type,
            before,
            after,
        })
    }
}

/// Key and block level changes between two roots
#[derive(Clone, Debug, Default)]
pub struct Difference {
    /// Changed keys in ascending order
    pub keys: Vec<KeyChange>,
    /// Shards reachable only from the second root
    pub additions: Vec<ShardBlock>,
    /// Shards reachable only from the first root
    pub removals: Vec<ShardBlock>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Before,
    After,
}

enum Task {
    Compare { before: Cid, after: Cid, prefix: String },
    Collect { link: Cid, prefix: String, side: Side },
}

#[derive(Default)]
struct Changes {
    keys: BTreeMap<String, (Option<Cid>, Option<Cid>)>,
    additions: BTreeMap<Cid, ShardBlock>,
    removals: BTreeMap<Cid, ShardBlock>,
}

impl Changes {
    fn record(&mut self, key: String, side: Side, value: Cid) {
        let slot = self.keys.entry(key).or_default();
        match side {
            Side::Before => slot.0 = Some(value),
            Side::After => slot.1 = Some(value),
        }
    }

    fn keep(&mut self, side: Side, block: ShardBlock) {
        match side {
            Side::Before => self.removals.insert(block.cid, block),
            Side::After => self.additions.insert(block.cid, block),
        };
    }
}

/// Compare the tries under `before` and `after`.
///
/// Subtrees present on one side only are walked in full. Shards reachable
/// from both roots, even under different keys, are not reported.
#[instrument(skip_all, fields(%before, %after))]
pub async fn difference<F: BlockFetcher + ?Sized>(blocks: &F, before: &Cid, after: &Cid) -> Result<Difference> {
    let shards = ShardFetcher::new(blocks);
    let mut changes = Changes::default();
    let mut tasks = vec![Task::Compare {
        before: *before,
        after: *after,
        prefix: String::new(),
    }];

    while let Some(task) = tasks.pop() {
        match task {
            Task::Compare { before, after, .. } if before == after => {}
            Task::Compare { before, after, prefix } => {
                let a = shards.get(&before, prefix.clone()).await?;
                let b = shards.get(&after, prefix.clone()).await?;
                compare(&prefix, &a, &b, &mut changes, &mut tasks);
                changes.keep(Side::Before, a);
                changes.keep(Side::After, b);
            }
            Task::Collect { link, prefix, side } => {
                let block = shards.get(&link, prefix.clone()).await?;
                for entry in &block.shard.entries {
                    let key = format!("{prefix}{}", entry.key);
                    if let Some(value) = entry.value.value() {
                        changes.record(key.clone(), side, *value);
                    }
                    if let Some(child) = entry.value.shard() {
                        tasks.push(Task::Collect {
                            link: *child,
                            prefix: key,
                            side,
                        });
                    }
                }
                changes.keep(side, block);
            }
        }
    }

    // identical subtrees reached through different paths cancel out
    let Changes {
        keys,
        mut additions,
        mut removals,
    } = changes;
    let shared: Vec<Cid> = additions.keys().filter(|cid| removals.contains_key(cid)).copied().collect();
    for cid in &shared {
        additions.remove(cid);
        removals.remove(cid);
    }

    Ok(Difference {
        keys: keys
            .into_iter()
            .filter_map(|(key, (before, after))| KeyChange::new(key, before, after))
            .collect(),
        additions: additions.into_values().collect(),
        removals: removals.into_values().collect(),
    })
}

/// Merge-walk the entries of two shards reached by the same prefix
fn compare(prefix: &str, a: &ShardBlock, b: &ShardBlock, changes: &mut Changes, tasks: &mut Vec<Task>) {
    let mut left = a.shard.entries.iter().peekable();
    let mut right = b.shard.entries.iter().peekable();

    loop {
        let (key, before, after) = match (left.peek().copied(), right.peek().copied()) {
            (None, None) => break,
            (Some(l), Some(r)) if l.key == r.key => {
                left.next();
                right.next();
                (&l.key, Some(&l.value), Some(&r.value))
            }
            (Some(l), Some(r)) if l.key > r.key => {
                right.next();
                (&r.key, None, Some(&r.value))
            }
            (Some(l), _) => {
                left.next();
                (&l.key, Some(&l.value), None)
            }
            (None, Some(r)) => {
                right.next();
                (&r.key, None, Some(&r.value))
            }
        };
        let full = format!("{prefix}{key}");

        let old = before.and_then(EntryValue::value);
        let new = after.and_then(EntryValue::value);
        if old != new {
            if let Some(value) = old {
                changes.record(full.clone(), Side::Before, *value);
            }
            if let Some(value) = new {
                changes.record(full.clone(), Side::After, *value);
            }
        }

        match (before.and_then(EntryValue::shard), after.and_then(EntryValue::shard)) {
            (Some(x), Some(y)) if x != y => tasks.push(Task::Compare {
                before: *x,
                after: *y,
                prefix: full,
            }),
            (Some(x), None) => tasks.push(Task::Collect {
                link: *x,
                prefix: full,
                side: Side::Before,
            }),
            (None, Some(y)) => tasks.push(Task::Collect {
                link: *y,
                prefix: full,
                side: Side::After,
            }),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{ShardBlock, ShardConfig};
    use crate::trie::{self, TrieResult};
    use cairn_blockstore::{create_cid, CidCodec, MemoryBlockStore};

    fn link(seed: &str) -> Cid {
        create_cid(seed.as_bytes(), CidCodec::Raw)
    }

    fn persist(store: &MemoryBlockStore, result: &TrieResult) {
        for block in &result.additions {
            store.insert(block.to_block());
        }
    }

    async fn build(store: &MemoryBlockStore, config: ShardConfig, pairs: &[(&str, &str)]) -> Cid {
        let empty = ShardBlock::create(config).unwrap();
        store.insert(empty.to_block());
        let mut root = empty.cid;
        for (key, value) in pairs {
            let result = trie::put(store, &root, key, link(value)).await.unwrap();
            persist(store, &result);
            root = result.root;
        }
        root
    }

    #[tokio::test]
    async fn test_difference_identical() {
        let store = MemoryBlockStore::new();
        let root = build(&store, ShardConfig::default(), &[("a", "1")]).await;

        let diff = difference(&store, &root, &root).await.unwrap();
        assert!(diff.keys.is_empty());
        assert!(diff.additions.is_empty());
        assert!(diff.removals.is_empty());
    }

    #[tokio::test]
    async fn test_difference_flat() {
        let store = MemoryBlockStore::new();
        let a = build(&store, ShardConfig::default(), &[("a", "1"), ("b", "2"), ("c", "3")]).await;
        let b = build(&store, ShardConfig::default(), &[("a", "1"), ("b", "two"), ("d", "4")]).await;

        let diff = difference(&store, &a, &b).await.unwrap();
        assert_eq!(
            diff.keys,
            vec![
                KeyChange::new("b", Some(link("2")), Some(link("two"))).unwrap(),
                KeyChange::new("c", Some(link("3")), None).unwrap(),
                KeyChange::new("d", None, Some(link("4"))).unwrap(),
            ]
        );
        assert_eq!(diff.keys[0].change_type, ChangeType::Modify);
        assert_eq!(diff.additions.iter().map(|s| s.cid).collect::<Vec<_>>(), vec![b]);
        assert_eq!(diff.removals.iter().map(|s| s.cid).collect::<Vec<_>>(), vec![a]);
    }

    #[tokio::test]
    async fn test_difference_one_sided_subtree() {
        let store = MemoryBlockStore::new();
        let config = ShardConfig::default().with_max_key_length(2);
        let a = build(&store, config, &[("x", "0")]).await;
        let b = build(&store, config, &[("x", "0"), ("abcde", "1"), ("abcdf", "2")]).await;

        let diff = difference(&store, &a, &b).await.unwrap();
        let keys: Vec<_> = diff.keys.iter().map(|k| k.key.as_str()).collect();
        assert_eq!(keys, vec!["abcde", "abcdf"]);
        assert!(diff.keys.iter().all(|k| k.change_type == ChangeType::Add));
        // new root plus the two chain shards under "ab"
        assert_eq!(diff.additions.len(), 3);
        assert_eq!(diff.removals.len(), 1);

        let reverse = difference(&store, &b, &a).await.unwrap();
        assert!(reverse.keys.iter().all(|k| k.change_type == ChangeType::Remove));
        assert_eq!(reverse.removals.len(), 3);
    }

    #[tokio::test]
    async fn test_difference_value_beside_link() {
        let store = MemoryBlockStore::new();
        let config = ShardConfig::default().with_max_key_length(2);
        let a = build(&store, config, &[("abc", "1")]).await;
        let b = build(&store, config, &[("abc", "1"), ("ab", "2")]).await;

        let diff = difference(&store, &a, &b).await.unwrap();
        assert_eq!(diff.keys, vec![KeyChange::new("ab", None, Some(link("2"))).unwrap()]);
        // the shared child under "ab" is not reported
        assert_eq!(diff.additions.len(), 1);
        assert_eq!(diff.removals.len(), 1);
    }
}
