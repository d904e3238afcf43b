//! Audit trace builder: minimal `(property, old, new)` records.
//!
//! # Invariants
//! - An event is produced only when the current value differs from the
//!   snapshot.
//! - Scalars compare by value, foreign keys by target identifier, collections
//!   by identifier set.
//! - The identifier column never appears in a trace.

use crate::audit::TraceEvent;
use crate::model::entity::{Entity, InstanceKey};
use crate::model::schema::FieldKind;
use crate::model::value::Value;
use crate::session::{PersistResult, Session};
use crate::tracking::diff::{canonical_membership, diff_members, membership_value, prior_membership};
use crate::tracking::{RelationKey, Snapshot};
use std::collections::BTreeSet;

/// Value of a column as the snapshot would record it.
pub(crate) fn comparable(kind: &FieldKind, value: &Value) -> Value {
    match kind {
        FieldKind::ForeignList { .. } => canonical_membership(value),
        _ => value.clone(),
    }
}

/// Column changes against `snapshot`; list columns only when `include_lists`.
pub(crate) fn column_changes(
    entity: &Entity,
    snapshot: &Snapshot,
    include_lists: bool,
) -> Vec<TraceEvent> {
    entity
        .schema()
        .columns()
        .filter(|field| include_lists || !matches!(field.kind, FieldKind::ForeignList { .. }))
        .filter_map(|field| {
            let current = comparable(&field.kind, entity.get(&field.name));
            let old = snapshot.value(&field.name).cloned().unwrap_or_default();
            (current != old).then(|| TraceEvent::new(field.name.clone(), old, current))
        })
        .collect()
}

/// Relationship change of one collection field, if any.
pub(crate) fn membership_change(
    field: &str,
    current: &BTreeSet<String>,
    baseline: &BTreeSet<String>,
) -> Option<TraceEvent> {
    let diff = diff_members(current, baseline);
    if diff.is_empty() {
        return None;
    }
    Some(TraceEvent::new(
        field,
        membership_value(prior_membership(current, &diff)),
        membership_value(current),
    ))
}

/// Every non-empty column with `Null` as old value.
pub(crate) fn creation_events(entity: &Entity, include_lists: bool) -> Vec<TraceEvent> {
    column_changes(entity, &Snapshot::new(), include_lists)
}

/// Every non-empty column with `Null` as new value.
pub(crate) fn deletion_events(entity: &Entity, include_lists: bool) -> Vec<TraceEvent> {
    entity
        .schema()
        .columns()
        .filter(|field| include_lists || !matches!(field.kind, FieldKind::ForeignList { .. }))
        .filter_map(|field| {
            let old = comparable(&field.kind, entity.get(&field.name));
            (!old.is_null()).then(|| TraceEvent::new(field.name.clone(), old, Value::Null))
        })
        .collect()
}

impl Session<'_> {
    /// Builds the trace of `entity` against its snapshot without writing.
    ///
    /// Transient and deleted entities have no trace. A stored entity without
    /// a snapshot adopts the current row first. Collections are compared only
    /// when requested and only when materialized in this session.
    pub fn trace(
        &mut self,
        entity: &Entity,
        include_collections: bool,
    ) -> PersistResult<Vec<TraceEvent>> {
        let key = self.instance_key(entity);
        if entity.is_deleted() || !matches!(key, InstanceKey::Stored { .. }) {
            return Ok(Vec::new());
        }
        self.ensure_snapshot(entity)?;
        let snapshot = self.snapshots.get(&key).cloned().unwrap_or_default();

        let mut events = column_changes(entity, &snapshot, include_collections);
        if include_collections {
            for field in entity.schema().collections() {
                let Some(handle) = self.relations.get(&RelationKey::new(key.clone(), &field.name))
                else {
                    continue;
                };
                let current = handle.borrow().member_keys();
                let change = membership_change(&field.name, &current, &snapshot.members(&field.name));
                if !field.kind.is_column() {
                    events.extend(change);
                    continue;
                }
                // A materialized foreign list is ahead of its column until save.
                let position = events.iter().position(|event| event.property == field.name);
                match (position, change) {
                    (Some(index), Some(event)) => events[index] = event,
                    (Some(index), None) => {
                        events.remove(index);
                    }
                    (None, Some(event)) => events.push(event),
                    (None, None) => {}
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::{EntitySchema, ScalarType};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use uuid::Uuid;

    fn schema() -> Arc<EntitySchema> {
        Arc::new(
            EntitySchema::builder("books")
                .scalar("title", ScalarType::Text)
                .nullable_scalar("pages", ScalarType::Integer)
                .foreign_list("shelves", "shelves")
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn column_changes_skip_equal_values_and_optionally_lists() {
        let mut values = BTreeMap::new();
        values.insert("title".to_string(), Value::from("Dune"));
        values.insert("shelves".to_string(), Value::from("b,a"));
        let mut book = Entity::loaded(schema(), Uuid::new_v4(), values);
        let snapshot = Snapshot::capture(&book);

        assert!(column_changes(&book, &snapshot, true).is_empty());

        book.set("pages", 412_i64).unwrap();
        book.set("shelves", "a").unwrap();
        let with_lists = column_changes(&book, &snapshot, true);
        assert_eq!(with_lists.len(), 2);
        assert_eq!(with_lists[0].property, "pages");
        assert_eq!(with_lists[0].old, Value::Null);
        assert_eq!(with_lists[1].old, Value::from("a,b"));

        assert_eq!(column_changes(&book, &snapshot, false).len(), 1);
    }

    #[test]
    fn membership_change_reports_prior_and_live_sets() {
        let current: BTreeSet<String> = ["b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let baseline: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let event = membership_change("tags", &current, &baseline).unwrap();
        assert_eq!(event.old, Value::from("a,b,c"));
        assert_eq!(event.new, Value::from("b,c,d"));
        assert!(membership_change("tags", &current, &current).is_none());
    }

    #[test]
    fn creation_and_deletion_events_list_non_empty_columns() {
        let mut book = Entity::new(&schema());
        book.set("title", "Emma").unwrap();
        let created = creation_events(&book, true);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].new, Value::from("Emma"));

        let deleted = deletion_events(&book, true);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].old, Value::from("Emma"));
        assert_eq!(deleted[0].new, Value::Null);
    }
}
