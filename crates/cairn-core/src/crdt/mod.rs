//! Trie writes recorded as Merkle clock events
//!
//! Each write resolves the root of the current head, applies the operation
//! to it and records the outcome as an event parented by the whole head.
//! Heads with several members are resolved by replaying the events since
//! their common ancestor in a fixed order (see [`resolve`]).

mod batch;
mod resolve;

pub use batch::CrdtBatch;

use crate::batch::Batch;
use crate::clock::{self, EventBlock, EventData};
use crate::shard::{ShardBlock, ShardConfig};
use crate::trie::{self, EntriesOptions, TrieResult};
use crate::Result;
use cairn_blockstore::{BlockFetcher, OverlayBlockFetcher};
use cid::Cid;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use ipld_core::ipld::Ipld;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, instrument};

/// One write inside a batch event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: Cid },
    Del { key: String },
}

impl BatchOp {
    pub fn key(&self) -> &str {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Del { key } => key,
        }
    }
}

/// Payload of a bucket clock event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// A single put
    Put { key: String, value: Cid, root: Cid },
    /// A single delete
    Del { key: String, root: Cid },
    /// Several writes applied together
    Batch { ops: Vec<BatchOp>, root: Cid },
}

impl Operation {
    /// Trie root after the operation was applied
    pub fn root(&self) -> &Cid {
        match self {
            Operation::Put { root, .. } | Operation::Del { root, .. } | Operation::Batch { root, .. } => root,
        }
    }

    /// The writes this operation carries
    pub fn ops(&self) -> Vec<BatchOp> {
        match self {
            Operation::Put { key, value, .. } => vec![BatchOp::Put {
                key: key.clone(),
                value: *value,
            }],
            Operation::Del { key, .. } => vec![BatchOp::Del { key: key.clone() }],
            Operation::Batch { ops, .. } => ops.clone(),
        }
    }
}

const TYPE: &str = "type";
const KEY: &str = "key";
const VALUE: &str = "value";
const ROOT: &str = "root";
const OPS: &str = "ops";

fn op_to_ipld(op: &BatchOp) -> BTreeMap<String, Ipld> {
    let mut map = BTreeMap::new();
    match op {
        BatchOp::Put { key, value } => {
            map.insert(TYPE.to_string(), Ipld::String("put".into()));
            map.insert(KEY.to_string(), Ipld::String(key.clone()));
            map.insert(VALUE.to_string(), Ipld::Link(*value));
        }
        BatchOp::Del { key } => {
            map.insert(TYPE.to_string(), Ipld::String("del".into()));
            map.insert(KEY.to_string(), Ipld::String(key.clone()));
        }
    }
    map
}

fn op_from_ipld(map: &mut BTreeMap<String, Ipld>) -> std::result::Result<BatchOp, String> {
    let kind = take_string(map, TYPE)?;
    let key = take_string(map, KEY)?;
    match kind.as_str() {
        "put" => Ok(BatchOp::Put {
            key,
            value: take_link(map, VALUE)?,
        }),
        "del" => Ok(BatchOp::Del { key }),
        other => Err(format!("unsupported operation {other:?}")),
    }
}

fn take_string(map: &mut BTreeMap<String, Ipld>, field: &str) -> std::result::Result<String, String> {
    match map.remove(field) {
        Some(Ipld::String(s)) => Ok(s),
        _ => Err(format!("missing {field}")),
    }
}

fn take_link(map: &mut BTreeMap<String, Ipld>, field: &str) -> std::result::Result<Cid, String> {
    match map.remove(field) {
        Some(Ipld::Link(cid)) => Ok(cid),
        _ => Err(format!("missing {field} link")),
    }
}

impl EventData for Operation {
    fn to_ipld(&self) -> Ipld {
        let mut map = match self {
            Operation::Put { key, value, .. } => op_to_ipld(&BatchOp::Put {
                key: key.clone(),
                value: *value,
            }),
            Operation::Del { key, .. } => op_to_ipld(&BatchOp::Del { key: key.clone() }),
            Operation::Batch { ops, .. } => {
                let mut map = BTreeMap::new();
                map.insert(TYPE.to_string(), Ipld::String("batch".into()));
                map.insert(
                    OPS.to_string(),
                    Ipld::List(ops.iter().map(|op| Ipld::Map(op_to_ipld(op))).collect()),
                );
                map
            }
        };
        map.insert(ROOT.to_string(), Ipld::Link(*self.root()));
        Ipld::Map(map)
    }

    fn from_ipld(ipld: Ipld) -> std::result::Result<Self, String> {
        let Ipld::Map(mut map) = ipld else {
            return Err("operation is not a map".into());
        };
        let root = take_link(&mut map, ROOT)?;

        if matches!(map.get(TYPE), Some(Ipld::String(kind)) if kind == "batch") {
            let Some(Ipld::List(raw)) = map.remove(OPS) else {
                return Err("missing ops list".into());
            };
            let ops = raw
                .into_iter()
                .map(|op| match op {
                    Ipld::Map(mut op) => op_from_ipld(&mut op),
                    _ => Err("batch op is not a map".to_string()),
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            return Ok(Operation::Batch { ops, root });
        }

        Ok(match op_from_ipld(&mut map)? {
            BatchOp::Put { key, value } => Operation::Put { key, value, root },
            BatchOp::Del { key } => Operation::Del { key, root },
        })
    }
}

/// A bucket write before it has been applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Put { key: String, value: Cid },
    Del { key: String },
    Batch(Vec<BatchOp>),
}

/// Outcome of a write against a clock head
#[derive(Clone, Debug)]
pub struct CrdtResult {
    /// Effective root after the write
    pub root: Cid,
    /// Shards to persist, including any produced while resolving the head
    pub additions: Vec<ShardBlock>,
    /// Shards no longer referenced
    pub removals: Vec<ShardBlock>,
    /// Head after the write
    pub head: Vec<Cid>,
    /// Event recording the write; `None` when nothing changed
    pub event: Option<EventBlock<Operation>>,
}

/// Accumulated shard additions and removals over several writes
#[derive(Debug, Default)]
pub(crate) struct Delta {
    additions: Vec<ShardBlock>,
    removals: Vec<ShardBlock>,
    added: HashSet<Cid>,
    removed: HashSet<Cid>,
}

impl Delta {
    /// Record a created shard once
    pub(crate) fn add(&mut self, block: &ShardBlock) {
        if self.added.insert(block.cid) {
            self.additions.push(block.clone());
        }
    }

    /// Record a dropped shard once
    pub(crate) fn remove(&mut self, block: &ShardBlock) {
        if self.removed.insert(block.cid) {
            self.removals.push(block.clone());
        }
    }

    pub(crate) fn absorb(&mut self, result: &TrieResult) {
        for block in &result.additions {
            self.add(block);
        }
        for block in &result.removals {
            self.remove(block);
        }
    }

    /// Drop blocks that were both created and removed, and finish with `root`
    pub(crate) fn finish(self, root: Cid) -> TrieResult {
        let Delta {
            mut additions,
            mut removals,
            added,
            removed,
        } = self;
        additions.retain(|b| !removed.contains(&b.cid));
        removals.retain(|b| !added.contains(&b.cid));
        TrieResult {
            root,
            additions,
            removals,
        }
    }
}

/// Put a value for a key
pub async fn put<F: BlockFetcher + ?Sized>(blocks: &F, head: &[Cid], key: &str, value: Cid) -> Result<CrdtResult> {
    let change = Change::Put {
        key: key.to_string(),
        value,
    };
    apply(blocks, head, change, ShardConfig::default()).await
}

/// Delete the value for a key
pub async fn del<F: BlockFetcher + ?Sized>(blocks: &F, head: &[Cid], key: &str) -> Result<CrdtResult> {
    apply(blocks, head, Change::Del { key: key.to_string() }, ShardConfig::default()).await
}

/// Apply `change` on top of `head`.
///
/// An empty head starts a new bucket whose root shard uses `config`; in every
/// other case the configuration already stored in the shards applies. A
/// change that leaves the root as it was creates no event.
#[instrument(skip_all, fields(head = head.len()))]
pub async fn apply<F: BlockFetcher + ?Sized>(
    blocks: &F,
    head: &[Cid],
    change: Change,
    config: ShardConfig,
) -> Result<CrdtResult> {
    let blocks = OverlayBlockFetcher::new(blocks);

    if head.is_empty() {
        return bootstrap(&blocks, change, config).await;
    }

    let (base, mut delta) = resolve::effective_root(&blocks, head).await?;
    let result = apply_change(&blocks, &base, &change).await?;
    if result.root == base {
        debug!(root = %base, "write left the root unchanged");
        return Ok(into_result(delta.finish(base), head.to_vec(), None));
    }
    delta.absorb(&result);

    let event = EventBlock::create(operation(change, result.root), head)?;
    blocks.insert(event.to_block());
    let head = clock::advance(&blocks, head, &event.cid).await?;

    Ok(into_result(delta.finish(result.root), head, Some(event)))
}

/// First write of a bucket: the empty root shard is reported with the rest
async fn bootstrap<F: BlockFetcher + ?Sized>(
    blocks: &OverlayBlockFetcher<'_, F>,
    change: Change,
    config: ShardConfig,
) -> Result<CrdtResult> {
    let empty = ShardBlock::create(config)?;
    blocks.insert(empty.to_block());

    let result = apply_change(blocks, &empty.cid, &change).await?;
    if result.root == empty.cid {
        return Ok(into_result(TrieResult::unchanged(empty.cid), Vec::new(), None));
    }

    let event = EventBlock::create(operation(change, result.root), &[])?;
    debug!(event = %event.cid, root = %result.root, "started new clock");
    let mut additions = vec![empty];
    additions.extend(result.additions);
    Ok(CrdtResult {
        root: result.root,
        additions,
        removals: result.removals,
        head: vec![event.cid],
        event: Some(event),
    })
}

/// Record `change` as applied, yielding `root`
pub(crate) fn operation(change: Change, root: Cid) -> Operation {
    match change {
        Change::Put { key, value } => Operation::Put { key, value, root },
        Change::Del { key } => Operation::Del { key, root },
        Change::Batch(ops) => Operation::Batch { ops, root },
    }
}

fn into_result(result: TrieResult, head: Vec<Cid>, event: Option<EventBlock<Operation>>) -> CrdtResult {
    CrdtResult {
        root: result.root,
        additions: result.additions,
        removals: result.removals,
        head,
        event,
    }
}

/// Apply a change directly to a trie root
pub(crate) async fn apply_change<F: BlockFetcher + ?Sized>(blocks: &F, root: &Cid, change: &Change) -> Result<TrieResult> {
    match change {
        Change::Put { key, value } => trie::put(blocks, root, key, *value).await,
        Change::Del { key } => trie::del(blocks, root, key).await,
        Change::Batch(ops) => apply_batch(blocks, root, ops).await,
    }
}

pub(crate) async fn apply_batch<F: BlockFetcher + ?Sized>(blocks: &F, root: &Cid, ops: &[BatchOp]) -> Result<TrieResult> {
    let mut batch = Batch::open(blocks, root).await?;
    for op in ops {
        match op {
            BatchOp::Put { key, value } => batch.put(key, *value).await?,
            BatchOp::Del { key } => batch.del(key).await?,
        }
    }
    batch.commit()
}

/// Resolve the effective root of `head`.
///
/// A multi-member head is replayed from its common ancestor; the shards
/// created along the way are returned as additions. `None` for an empty head.
#[instrument(skip_all, fields(head = head.len()))]
pub async fn root<F: BlockFetcher + ?Sized>(blocks: &F, head: &[Cid]) -> Result<Option<TrieResult>> {
    if head.is_empty() {
        return Ok(None);
    }
    let blocks = OverlayBlockFetcher::new(blocks);
    let (root, delta) = resolve::effective_root(&blocks, head).await?;
    Ok(Some(delta.finish(root)))
}

/// Get the value for a key under `head`
#[instrument(skip_all, fields(head = head.len(), key = %key))]
pub async fn get<F: BlockFetcher + ?Sized>(blocks: &F, head: &[Cid], key: &str) -> Result<Option<Cid>> {
    if head.is_empty() {
        return Ok(None);
    }
    let blocks = OverlayBlockFetcher::new(blocks);
    let (root, _) = resolve::effective_root(&blocks, head).await?;
    trie::get(&blocks, &root, key).await
}

/// Lazily list the entries under `head`
#[instrument(skip_all, fields(head = head.len()))]
pub async fn entries<'a, F: BlockFetcher + ?Sized>(
    blocks: &'a F,
    head: &[Cid],
    options: EntriesOptions,
) -> Result<BoxStream<'a, Result<(String, Cid)>>> {
    if head.is_empty() {
        return Ok(stream::empty().boxed());
    }
    let blocks = OverlayBlockFetcher::new(blocks);
    let (root, _) = resolve::effective_root(&blocks, head).await?;
    Ok(trie::entries(blocks, root, options).boxed())
}

/// Collect every entry under `head` matching `options`
pub async fn entries_vec<F: BlockFetcher + ?Sized>(
    blocks: &F,
    head: &[Cid],
    options: EntriesOptions,
) -> Result<Vec<(String, Cid)>> {
    entries(blocks, head, options).await?.try_collect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_blockstore::{create_cid, CidCodec, MemoryBlockStore};

    fn link(seed: &str) -> Cid {
        create_cid(seed.as_bytes(), CidCodec::Raw)
    }

    fn persist(store: &MemoryBlockStore, result: &CrdtResult) {
        for block in &result.additions {
            store.insert(block.to_block());
        }
        if let Some(event) = &result.event {
            store.insert(event.to_block());
        }
    }

    #[test]
    fn test_operation_ipld_round_trip() {
        let root = link("root");
        let ops = [
            Operation::Put {
                key: "a".into(),
                value: link("1"),
                root,
            },
            Operation::Del { key: "a".into(), root },
            Operation::Batch {
                ops: vec![
                    BatchOp::Put {
                        key: "b".into(),
                        value: link("2"),
                    },
                    BatchOp::Del { key: "c".into() },
                ],
                root,
            },
        ];
        for op in ops {
            assert_eq!(Operation::from_ipld(op.to_ipld()).unwrap(), op);
        }
    }

    #[test]
    fn test_operation_rejects_unknown_type() {
        let mut map = BTreeMap::new();
        map.insert(TYPE.to_string(), Ipld::String("move".into()));
        map.insert(KEY.to_string(), Ipld::String("a".into()));
        map.insert(ROOT.to_string(), Ipld::Link(link("root")));

        let err = Operation::from_ipld(Ipld::Map(map)).unwrap_err();
        assert!(err.contains("move"));
    }

    #[test_log::test(tokio::test)]
    async fn test_bootstrap_put() {
        let store = MemoryBlockStore::new();
        let result = put(&store, &[], "a", link("1")).await.unwrap();

        // empty root shard plus the root holding "a"
        assert_eq!(result.additions.len(), 2);
        assert!(result.removals.is_empty());
        let event = result.event.clone().unwrap();
        assert_eq!(result.head, vec![event.cid]);
        assert!(event.event.is_genesis());
        assert_eq!(event.event.data.root(), &result.root);

        persist(&store, &result);
        assert_eq!(get(&store, &result.head, "a").await.unwrap(), Some(link("1")));
    }

    #[tokio::test]
    async fn test_linear_writes() {
        let store = MemoryBlockStore::new();
        let first = put(&store, &[], "a", link("1")).await.unwrap();
        persist(&store, &first);
        let second = put(&store, &first.head, "b", link("2")).await.unwrap();
        persist(&store, &second);

        assert_eq!(second.head.len(), 1);
        assert_eq!(second.event.as_ref().unwrap().event.parents, first.head);

        let all = entries_vec(&store, &second.head, EntriesOptions::default()).await.unwrap();
        assert_eq!(all, vec![("a".to_string(), link("1")), ("b".to_string(), link("2"))]);

        let deleted = del(&store, &second.head, "a").await.unwrap();
        persist(&store, &deleted);
        assert_eq!(get(&store, &deleted.head, "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unchanged_write_creates_no_event() {
        let store = MemoryBlockStore::new();
        let first = put(&store, &[], "a", link("1")).await.unwrap();
        persist(&store, &first);

        let again = put(&store, &first.head, "a", link("1")).await.unwrap();
        assert!(again.event.is_none());
        assert_eq!(again.head, first.head);
        assert_eq!(again.root, first.root);
        assert!(again.additions.is_empty());

        let missing = del(&store, &first.head, "zz").await.unwrap();
        assert!(missing.event.is_none());
    }

    #[tokio::test]
    async fn test_empty_head_reads() {
        let store = MemoryBlockStore::new();
        assert!(root(&store, &[]).await.unwrap().is_none());
        assert_eq!(get(&store, &[], "a").await.unwrap(), None);
        assert!(entries_vec(&store, &[], EntriesOptions::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_batch_change() {
        let store = MemoryBlockStore::new();
        let ops = vec![
            BatchOp::Put {
                key: "a".into(),
                value: link("1"),
            },
            BatchOp::Put {
                key: "b".into(),
                value: link("2"),
            },
            BatchOp::Del { key: "a".into() },
        ];
        let result = apply(&store, &[], Change::Batch(ops.clone()), ShardConfig::default())
            .await
            .unwrap();
        persist(&store, &result);

        let event = result.event.unwrap();
        assert!(matches!(&event.event.data, Operation::Batch { ops: recorded, .. } if recorded == &ops));
        let all = entries_vec(&store, &result.head, EntriesOptions::default()).await.unwrap();
        assert_eq!(all, vec![("b".to_string(), link("2"))]);
    }

    #[test]
    fn test_delta_deduplicates_and_nets() {
        let [a, b, c] = [
            ShardConfig::default(),
            ShardConfig::default().with_max_size(1024),
            ShardConfig::default().with_max_key_length(8),
        ]
        .map(|config| ShardBlock::create(config).unwrap());

        let first = TrieResult {
            root: b.cid,
            additions: vec![a.clone(), b.clone()],
            removals: vec![c.clone()],
        };
        let second = TrieResult {
            root: b.cid,
            additions: vec![b.clone()],
            removals: vec![a.clone(), c.clone()],
        };

        let mut delta = Delta::default();
        delta.absorb(&first);
        delta.absorb(&first);
        delta.absorb(&second);
        assert_eq!(delta.additions.len(), 2);
        assert_eq!(delta.removals.len(), 2);

        let result = delta.finish(b.cid);
        assert_eq!(result.additions, vec![b]);
        assert_eq!(result.removals, vec![c]);
    }
}
