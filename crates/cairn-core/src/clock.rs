//! Merkle clock: a DAG of immutable events and its head set
//!
//! Every event names its causal parents. A head is the set of events that
//! no other known event descends from; writes made on independent replicas
//! show up as a head with more than one member until a later event
//! descends from all of them.
//!
//! Events are encoded as DAG-CBOR maps:
//!
//! ```text
//! { "data": <payload>, "parents": [link, ...] }
//! ```

use crate::{CoreError, Result};
use bytes::Bytes;
use cairn_blockstore::{compare_cid_bytes, create_cid, Block, BlockFetcher, CidCodec};
use cid::Cid;
use ipld_core::ipld::Ipld;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, instrument};

const DATA: &str = "data";
const PARENTS: &str = "parents";

/// A payload carried by clock events
pub trait EventData: Clone + Send + Sync + Sized {
    /// Convert the payload into its IPLD form
    fn to_ipld(&self) -> Ipld;

    /// Rebuild the payload, describing what is wrong on failure
    fn from_ipld(ipld: Ipld) -> std::result::Result<Self, String>;
}

impl EventData for Ipld {
    fn to_ipld(&self) -> Ipld {
        self.clone()
    }

    fn from_ipld(ipld: Ipld) -> std::result::Result<Self, String> {
        Ok(ipld)
    }
}

/// One logical operation and the events it causally follows
#[derive(Clone, Debug, PartialEq)]
pub struct Event<T> {
    /// Parent links in canonical (binary CID) order, without duplicates
    pub parents: Vec<Cid>,
    /// Payload
    pub data: T,
}

impl<T> Event<T> {
    /// Create an event; parent order does not affect its identity
    pub fn new(data: T, parents: impl IntoIterator<Item = Cid>) -> Self {
        let mut parents: Vec<Cid> = parents.into_iter().collect();
        parents.sort_by(compare_cid_bytes);
        parents.dedup();
        Self { parents, data }
    }

    /// Whether this event starts a history
    pub fn is_genesis(&self) -> bool {
        self.parents.is_empty()
    }
}

/// An encoded event together with its CID
#[derive(Clone, Debug)]
pub struct EventBlock<T> {
    /// Content identifier
    pub cid: Cid,
    /// Canonical bytes
    pub bytes: Bytes,
    /// Decoded event
    pub event: Event<T>,
}

impl<T: EventData> EventBlock<T> {
    /// Encode a new event over `parents`
    pub fn create(data: T, parents: &[Cid]) -> Result<Self> {
        let event = Event::new(data, parents.iter().copied());

        let mut map = BTreeMap::new();
        map.insert(DATA.to_string(), event.data.to_ipld());
        map.insert(
            PARENTS.to_string(),
            Ipld::List(event.parents.iter().copied().map(Ipld::Link).collect()),
        );
        let bytes = serde_ipld_dagcbor::to_vec(&Ipld::Map(map))
            .map(Bytes::from)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        let cid = create_cid(&bytes, CidCodec::DagCbor);

        debug!(%cid, parents = event.parents.len(), "created event");
        Ok(Self { cid, bytes, event })
    }

    /// Decode event bytes stored under `cid`
    pub fn decode(cid: Cid, bytes: Bytes) -> Result<Self> {
        let ipld: Ipld =
            serde_ipld_dagcbor::from_slice(&bytes).map_err(|e| CoreError::invalid_event(cid, e.to_string()))?;
        let Ipld::Map(mut map) = ipld else {
            return Err(CoreError::invalid_event(cid, "expected a map"));
        };

        let Some(Ipld::List(raw_parents)) = map.remove(PARENTS) else {
            return Err(CoreError::invalid_event(cid, "missing parents list"));
        };
        let parents = raw_parents
            .into_iter()
            .map(|parent| match parent {
                Ipld::Link(link) => Ok(link),
                _ => Err(CoreError::invalid_event(cid, "parent is not a link")),
            })
            .collect::<Result<Vec<_>>>()?;

        let data = map
            .remove(DATA)
            .ok_or_else(|| CoreError::invalid_event(cid, "missing data"))?;
        let data = T::from_ipld(data).map_err(|reason| CoreError::invalid_event(cid, reason))?;

        Ok(Self {
            cid,
            bytes,
            event: Event { parents, data },
        })
    }
}

impl<T> EventBlock<T> {
    /// Convert to a storable block
    pub fn to_block(&self) -> Block {
        Block::new(self.cid, self.bytes.clone())
    }
}

/// Loads events, decoding each one at most once
pub struct EventFetcher<F: BlockFetcher, T> {
    blocks: F,
    seen: Mutex<HashMap<Cid, EventBlock<T>>>,
}

impl<F: BlockFetcher, T: EventData> EventFetcher<F, T> {
    pub fn new(blocks: F) -> Self {
        Self {
            blocks,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying block fetcher
    pub fn blocks(&self) -> &F {
        &self.blocks
    }

    /// Fetch and decode the event at `link`
    pub async fn get(&self, link: &Cid) -> Result<EventBlock<T>> {
        let hit = self.seen.lock().get(link).cloned();
        if let Some(hit) = hit {
            return Ok(hit);
        }

        let bytes = self
            .blocks
            .get_block(link)
            .await?
            .ok_or(CoreError::MissingBlock(*link))?;
        let block = EventBlock::decode(*link, bytes)?;
        self.seen.lock().insert(*link, block.clone());
        Ok(block)
    }

    /// Parents of the event at `link`
    pub async fn parents(&self, link: &Cid) -> Result<Vec<Cid>> {
        Ok(self.get(link).await?.event.parents)
    }
}

/// Advance `head` with `event`, returning the new head.
///
/// Members the event descends from are replaced by it. An event that some
/// member already descends from leaves the head untouched; anything else is
/// concurrent and joins the head.
#[instrument(skip_all, fields(%event, head = head.len()))]
pub async fn advance<F: BlockFetcher + ?Sized>(blocks: &F, head: &[Cid], event: &Cid) -> Result<Vec<Cid>> {
    if head.contains(event) {
        return Ok(head.to_vec());
    }

    let events: EventFetcher<&F, Ipld> = EventFetcher::new(blocks);

    let mut next = Vec::with_capacity(head.len() + 1);
    let mut superseded = false;
    for member in head {
        if contains(&events, event, member).await? {
            superseded = true;
        } else {
            next.push(*member);
        }
    }
    if superseded {
        next.push(*event);
        debug!(replaced = head.len() + 1 - next.len(), "event supersedes head members");
        return Ok(next);
    }

    for member in head {
        if contains(&events, member, event).await? {
            debug!(%member, "event already in history");
            return Ok(head.to_vec());
        }
    }

    debug!("concurrent event joins head");
    let mut next = head.to_vec();
    next.push(*event);
    Ok(next)
}

/// Whether `a` is, or descends from, `b`.
///
/// Breadth first over `a`'s ancestry, visiting each event once. Once a link
/// is one of `b`'s parents the walk does not go below it, since `b` cannot
/// sit underneath its own parent.
pub async fn contains<F: BlockFetcher, T: EventData>(events: &EventFetcher<F, T>, a: &Cid, b: &Cid) -> Result<bool> {
    if a == b {
        return Ok(true);
    }

    let blocked: HashSet<Cid> = events.parents(b).await?.into_iter().collect();
    let mut queue: VecDeque<Cid> = events.parents(a).await?.into();
    let mut seen = HashSet::new();

    while let Some(link) = queue.pop_front() {
        if link == *b {
            return Ok(true);
        }
        if blocked.contains(&link) || !seen.insert(link) {
            continue;
        }
        queue.extend(events.parents(&link).await?);
    }
    Ok(false)
}

/// Render the history under `head` as Graphviz DOT lines
pub async fn visualize<F: BlockFetcher + ?Sized>(blocks: &F, head: &[Cid]) -> Result<Vec<String>> {
    visualize_with(blocks, head, |block| short_link(&block.cid)).await
}

/// Render the history under `head`, labelling each event with `label`
#[instrument(skip_all, fields(head = head.len()))]
pub async fn visualize_with<F, L>(blocks: &F, head: &[Cid], label: L) -> Result<Vec<String>>
where
    F: BlockFetcher + ?Sized,
    L: Fn(&EventBlock<Ipld>) -> String,
{
    let events: EventFetcher<&F, Ipld> = EventFetcher::new(blocks);
    let mut lines = vec![
        "digraph clock {".to_string(),
        "  node [shape=point fontname=\"Courier\"]; head;".to_string(),
    ];

    let mut nodes = HashSet::new();
    let mut queue = VecDeque::new();
    for link in head {
        let block = events.get(link).await?;
        nodes.insert(block.cid);
        lines.push(format!(
            "  node [shape=oval fontname=\"Courier\"]; {} [label=\"{}\"];",
            block.cid,
            label(&block)
        ));
        lines.push(format!("  head -> {};", block.cid));
        for parent in &block.event.parents {
            lines.push(format!("  {} -> {parent};", block.cid));
        }
        queue.extend(block.event.parents.iter().copied());
    }

    while let Some(link) = queue.pop_front() {
        if !nodes.insert(link) {
            continue;
        }
        let block = events.get(&link).await?;
        lines.push(format!(
            "  node [shape=oval]; {link} [label=\"{}\" fontname=\"Courier\"];",
            label(&block)
        ));
        for parent in &block.event.parents {
            lines.push(format!("  {link} -> {parent};"));
        }
        queue.extend(block.event.parents.iter().copied());
    }

    lines.push("}".to_string());
    Ok(lines)
}

/// First and last four characters of a CID's string form
pub fn short_link(cid: &Cid) -> String {
    let s = cid.to_string();
    let head: String = s.chars().take(4).collect();
    let tail: String = s.chars().skip(s.chars().count().saturating_sub(4)).collect();
    format!("{head}..{tail}")
}
