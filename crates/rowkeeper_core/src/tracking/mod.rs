//! In-memory change tracking: snapshots, collections and membership diffs.
//!
//! # Responsibility
//! - Remember what storage last held for each instance.
//! - Hand out one shared collection object per instance and field.
//! - Compute added/removed members against the last persisted membership.
//!
//! # Invariants
//! - All state here is scoped to one session; nothing is process-global.

pub mod collection;
pub mod diff;
pub mod snapshot;

pub use collection::{CollectionHandle, RelationCollection, RelationKey, RelationshipCache};
pub use diff::{diff_members, CollectionDiff};
pub use snapshot::{Snapshot, SnapshotStore};
