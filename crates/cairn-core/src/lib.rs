//! # Cairn Core
//!
//! Core engine for Cairn buckets: a content-addressed, prefix-sharded
//! key/value trie with a Merkle clock that lets independent replicas write
//! concurrently and converge on the same root.
//!
//! This crate provides:
//! - **Shards**: canonical DAG-CBOR trie nodes with size-driven splitting
//! - **Trie**: put, get, delete and ordered range iteration over a root
//! - **Batches**: many writes committed with one encode per touched shard
//! - **Diffs**: key and block level differences between two roots
//! - **Clock**: causal event history and head advancement
//! - **CRDT**: writes recorded as events, multi-head replay and merge
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                 Bucket                  │
//! ├─────────────────────────────────────────┤
//! │        CRDT merge       │     Clock     │
//! ├─────────────────────────────────────────┤
//! │   Trie   │   Batch   │   Diff           │
//! ├─────────────────────────────────────────┤
//! │           Shards + codec                │
//! ├─────────────────────────────────────────┤
//! │           BlockFetcher                  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Engines never write to the block store. Every write returns the shards it
//! created (`additions`) and made obsolete (`removals`); [`Bucket`] is the
//! one place that persists them.

pub mod batch;
pub mod bucket;
pub mod clock;
pub mod crdt;
pub mod diff;
pub mod error;
pub mod shard;
pub mod trie;

pub use batch::Batch;
pub use bucket::{Bucket, BucketConfig};
pub use clock::{advance, Event, EventBlock, EventData, EventFetcher};
pub use crdt::{BatchOp, Change, CrdtBatch, CrdtResult, Operation};
pub use diff::{difference, ChangeType, Difference, KeyChange};
pub use error::{CoreError, Result};
pub use shard::{EntryValue, Shard, ShardBlock, ShardConfig, ShardEntry};
pub use trie::{EntriesOptions, TrieResult};
