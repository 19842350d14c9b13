//! Resolving a multi-member head into one trie root
//!
//! 1. Find the nearest event every head member descends from.
//! 2. Gather the events between it and the head, weighting each by the sum
//!    of its depths over every path from a head member. Heavier events are
//!    older; ties go to the smaller CID string.
//! 3. Drop writes that lose a conflict: within a batch only the last write
//!    to a key counts, a put beats a concurrent delete of the same key, and
//!    concurrent deletes of one key collapse into the first.
//! 4. Replay what is left on top of the ancestor's root.
//!
//! Every replica holding the same events computes the same root.

use super::{apply_batch, BatchOp, Delta, Operation};
use crate::clock::{EventBlock, EventFetcher};
use crate::trie;
use crate::{CoreError, Result};
use cairn_blockstore::{BlockFetcher, OverlayBlockFetcher};
use cid::Cid;
use futures::future::{BoxFuture, FutureExt};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

type Events<'a, 'b, F> = EventFetcher<&'a OverlayBlockFetcher<'b, F>, Operation>;

/// Effective root of a non-empty `head`, with the shards replay created.
///
/// Replayed shards are inserted into `blocks` so later reads through it
/// can see them.
pub(crate) async fn effective_root<F: BlockFetcher + ?Sized>(
    blocks: &OverlayBlockFetcher<'_, F>,
    head: &[Cid],
) -> Result<(Cid, Delta)> {
    let events: Events<'_, '_, F> = EventFetcher::new(blocks);

    if let [only] = head {
        let event = events.get(only).await?;
        return Ok((*event.event.data.root(), Delta::default()));
    }

    let mut children = head.to_vec();
    children.sort_by(cairn_blockstore::compare_cid_bytes);
    let ancestor = common_ancestor(&events, children)
        .await?
        .ok_or(CoreError::NoCommonAncestor)?;
    let mut root = *events.get(&ancestor).await?.event.data.root();

    let sorted = sorted_events(&events, head, &ancestor).await?;
    let plan = resolve_conflicts(&sorted);
    debug!(%ancestor, events = sorted.len(), "replaying concurrent events");

    let mut delta = Delta::default();
    for (block, ops) in sorted.iter().zip(plan) {
        let Some(ops) = ops else {
            trace!(event = %block.cid, "skipping superseded event");
            continue;
        };
        trace!(event = %block.cid, ops = ops.len(), "replaying event");

        let result = match (&block.event.data, ops.as_slice()) {
            (Operation::Batch { .. }, ops) => apply_batch(blocks, &root, ops).await?,
            (_, [BatchOp::Put { key, value }]) => trie::put(blocks, &root, key, *value).await?,
            (_, [BatchOp::Del { key }]) => trie::del(blocks, &root, key).await?,
            _ => continue,
        };
        for shard in &result.additions {
            blocks.insert(shard.to_block());
        }
        delta.absorb(&result);
        root = result.root;
    }

    Ok((root, delta))
}

/// Nearest event shared by the ancestry of every link in `children`.
///
/// Each branch walks back one step per round, following single parents and
/// resolving merge events to their own common ancestor. `None` once every
/// branch has run out of history without meeting.
fn common_ancestor<'e, 'a, 'b, F: BlockFetcher + ?Sized>(
    events: &'e Events<'a, 'b, F>,
    children: Vec<Cid>,
) -> BoxFuture<'e, Result<Option<Cid>>> {
    async move {
        let mut candidates: Vec<Vec<Cid>> = children.into_iter().map(|c| vec![c]).collect();
        loop {
            let mut changed = false;
            for i in 0..candidates.len() {
                let Some(&last) = candidates[i].last() else {
                    continue;
                };
                let Some(next) = ancestor_candidate(events, last).await? else {
                    continue;
                };
                changed = true;
                candidates[i].push(next);
                if let Some(found) = shared_link(&candidates) {
                    return Ok(Some(found));
                }
            }
            if !changed {
                return Ok(None);
            }
        }
    }
    .boxed()
}

async fn ancestor_candidate<F: BlockFetcher + ?Sized>(events: &Events<'_, '_, F>, link: Cid) -> Result<Option<Cid>> {
    let parents = events.parents(&link).await?;
    match parents.as_slice() {
        [] => Ok(None),
        [parent] => Ok(Some(*parent)),
        _ => common_ancestor(events, parents).await,
    }
}

/// First link, scanning branches in order, that every branch has walked
fn shared_link(branches: &[Vec<Cid>]) -> Option<Cid> {
    branches.iter().enumerate().find_map(|(i, branch)| {
        branch.iter().copied().find(|link| {
            branches
                .iter()
                .enumerate()
                .all(|(j, other)| i == j || other.contains(link))
        })
    })
}

/// Events strictly between `tail` and `head`, in replay order.
///
/// An event's weight is the sum of its depths over every path from a head
/// member. Path counts and depth sums are carried from children to parents
/// in topological order, so each event is visited once.
async fn sorted_events<F: BlockFetcher + ?Sized>(
    events: &Events<'_, '_, F>,
    head: &[Cid],
    tail: &Cid,
) -> Result<Vec<EventBlock<Operation>>> {
    let mut parents: HashMap<Cid, Vec<Cid>> = HashMap::new();
    let mut pending: Vec<Cid> = head.iter().copied().filter(|link| link != tail).collect();
    while let Some(link) = pending.pop() {
        if parents.contains_key(&link) {
            continue;
        }
        let above: Vec<Cid> = events
            .parents(&link)
            .await?
            .into_iter()
            .filter(|parent| parent != tail)
            .collect();
        pending.extend(above.iter().copied());
        parents.insert(link, above);
    }

    // children not yet folded into each event
    let mut waiting: HashMap<Cid, usize> = parents.keys().map(|&link| (link, 0)).collect();
    for above in parents.values() {
        for parent in above {
            *waiting.entry(*parent).or_default() += 1;
        }
    }

    // (paths reaching the event, summed depth over those paths)
    let mut paths: HashMap<Cid, (u64, u64)> = HashMap::new();
    for member in head.iter().filter(|link| *link != tail) {
        paths.entry(*member).or_default().0 += 1;
    }

    let mut ready: Vec<Cid> = waiting
        .iter()
        .filter(|(_, &children)| children == 0)
        .map(|(&link, _)| link)
        .collect();
    let mut weights: Vec<(u64, Cid)> = Vec::with_capacity(parents.len());
    while let Some(link) = ready.pop() {
        let (count, depth) = paths.get(&link).copied().unwrap_or_default();
        weights.push((depth, link));
        for parent in parents.get(&link).map(Vec::as_slice).unwrap_or_default() {
            let (parent_count, parent_depth) = paths.entry(*parent).or_default();
            *parent_count = parent_count.saturating_add(count);
            *parent_depth = parent_depth.saturating_add(depth).saturating_add(count);
            if let Some(children) = waiting.get_mut(parent) {
                *children -= 1;
                if *children == 0 {
                    ready.push(*parent);
                }
            }
        }
    }

    let mut order: Vec<(u64, String, Cid)> = weights
        .into_iter()
        .map(|(weight, cid)| (weight, cid.to_string(), cid))
        .collect();
    order.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let mut sorted = Vec::with_capacity(order.len());
    for (_, _, cid) in order {
        sorted.push(events.get(&cid).await?);
    }
    Ok(sorted)
}

/// Writes each event still contributes after conflict resolution.
///
/// `sorted` must have every parent before its children, which the weight
/// order guarantees: a parent is at least one deeper on every path through
/// its child. `None` marks an event with nothing left to replay.
fn resolve_conflicts(sorted: &[EventBlock<Operation>]) -> Vec<Option<Vec<BatchOp>>> {
    let index: HashMap<Cid, usize> = sorted.iter().enumerate().map(|(i, b)| (b.cid, i)).collect();

    // ancestors of each event within the replayed set
    let mut ancestry: Vec<HashSet<usize>> = Vec::with_capacity(sorted.len());
    for block in sorted {
        let mut set = HashSet::new();
        for parent in &block.event.parents {
            if let Some(&p) = index.get(parent) {
                set.insert(p);
                if let Some(above) = ancestry.get(p) {
                    set.extend(above.iter().copied());
                }
            }
        }
        ancestry.push(set);
    }
    let concurrent = |a: usize, b: usize| a != b && !ancestry[a].contains(&b) && !ancestry[b].contains(&a);

    let mut plan: Vec<Vec<Option<BatchOp>>> = sorted
        .iter()
        .map(|block| last_write_per_key(block.event.data.ops()).into_iter().map(Some).collect())
        .collect();

    let mut puts: HashMap<String, Vec<usize>> = HashMap::new();
    let mut dels: HashMap<String, Vec<(usize, usize)>> = HashMap::new();
    for (event, ops) in plan.iter().enumerate() {
        for (slot, op) in ops.iter().enumerate() {
            match op {
                Some(BatchOp::Put { key, .. }) => puts.entry(key.clone()).or_default().push(event),
                Some(BatchOp::Del { key }) => dels.entry(key.clone()).or_default().push((event, slot)),
                None => {}
            }
        }
    }

    for (key, deletes) in dels {
        let writers = puts.get(&key).map(Vec::as_slice).unwrap_or_default();
        let mut kept: Vec<usize> = Vec::new();
        for (event, slot) in deletes {
            let put_wins = writers.iter().any(|&p| concurrent(p, event));
            let duplicate = kept.iter().any(|&k| concurrent(k, event));
            if put_wins || duplicate {
                trace!(key = %key, event = %sorted[event].cid, put_wins, "dropping delete");
                plan[event][slot] = None;
            } else {
                kept.push(event);
            }
        }
    }

    plan.into_iter()
        .map(|ops| {
            let ops: Vec<BatchOp> = ops.into_iter().flatten().collect();
            (!ops.is_empty()).then_some(ops)
        })
        .collect()
}

/// Keep only the final write to each key, in the order those writes occur
fn last_write_per_key(ops: Vec<BatchOp>) -> Vec<BatchOp> {
    let mut seen = HashSet::new();
    let mut kept: Vec<BatchOp> = ops.into_iter().rev().filter(|op| seen.insert(op.key().to_string())).collect();
    kept.reverse();
    kept
}
