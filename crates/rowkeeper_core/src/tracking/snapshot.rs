//! Snapshot store: last-known-persisted values per instance.

use crate::model::entity::{Entity, InstanceKey};
use crate::model::schema::FieldKind;
use crate::model::value::Value;
use crate::tracking::diff::{canonical_membership, parse_membership};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Field name to value as last read from or written to storage.
///
/// Relationship fields hold comparison strings rather than live members.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    values: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures every column of `entity`; list columns are canonicalized.
    pub fn capture(entity: &Entity) -> Self {
        let mut snapshot = Self::new();
        for field in entity.schema().columns() {
            let value = entity.get(&field.name);
            let value = match field.kind {
                FieldKind::ForeignList { .. } => canonical_membership(value),
                _ => value.clone(),
            };
            snapshot.set(&field.name, value);
        }
        snapshot
    }

    pub fn value(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.values.insert(field.to_string(), value);
    }

    /// Member keys recorded for a relationship field.
    pub fn members(&self, field: &str) -> BTreeSet<String> {
        self.values
            .get(field)
            .map(parse_membership)
            .unwrap_or_default()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    entries: HashMap<InstanceKey, Snapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &InstanceKey) -> Option<&Snapshot> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Replaces the whole snapshot (load, refresh).
    pub fn replace(&mut self, key: InstanceKey, snapshot: Snapshot) {
        self.entries.insert(key, snapshot);
    }

    /// Updates one field, creating the snapshot if needed (post-save).
    pub fn update(&mut self, key: &InstanceKey, field: &str, value: Value) {
        self.entries
            .entry(key.clone())
            .or_default()
            .set(field, value);
    }

    pub fn remove(&mut self, key: &InstanceKey) -> Option<Snapshot> {
        self.entries.remove(key)
    }

    /// Snapshot value of one field; `Null` when absent.
    pub fn value(&self, key: &InstanceKey, field: &str) -> Value {
        self.get(key)
            .and_then(|snapshot| snapshot.value(field))
            .cloned()
            .unwrap_or_default()
    }

    pub fn members(&self, key: &InstanceKey, field: &str) -> BTreeSet<String> {
        self.get(key)
            .map(|snapshot| snapshot.members(field))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
