//! Relationship materialization and reconciliation.
//!
//! # Responsibility
//! - Materialize collections once per instance and field.
//! - Persist membership changes: back-reference stamping for one-to-many,
//!   join rows for many-to-many, identifier lists for foreign-reference lists.
//! - Release children before their owner row is deleted.
//!
//! # Invariants
//! - Removals and detaches run first, member saves next, join-table writes
//!   last.
//! - Collections are never borrowed across a nested save.
//! - Vanished rows are skipped with a `warn` event, never raised.

use crate::audit::TraceEvent;
use crate::model::entity::{Entity, EntityId, InstanceKey};
use crate::model::schema::{FieldDescriptor, FieldKind, ManyToMany, OneToMany, SchemaError};
use crate::model::value::{LazyRef, Value};
use crate::repo::Condition;
use crate::session::trace::membership_change;
use crate::session::{PersistResult, Session};
use crate::tracking::diff::{membership_value, parse_membership};
use crate::tracking::{CollectionHandle, RelationCollection, RelationKey};
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use uuid::Uuid;

impl Session<'_> {
    /// Returns the collection of `owner.field`, materializing it on first
    /// access. Repeated calls return the same object.
    pub fn collection(&mut self, owner: &Entity, field: &str) -> PersistResult<CollectionHandle> {
        let result = self.materialize(owner, field);
        self.observe("collection_load", result)
    }

    /// Adds `member` to `owner.field`; returns `false` when already present.
    pub fn add_member(&mut self, owner: &Entity, field: &str, mut member: Entity) -> PersistResult<bool> {
        let target = relation_target(owner, field)?;
        if member.table() != target {
            return Err(SchemaError::TypeMismatch {
                table: owner.table().to_string(),
                field: field.to_string(),
                expected: "member of the relation target",
            }
            .into());
        }
        self.adopt_if_saved(&mut member);
        let handle = self.collection(owner, field)?;
        let added = handle.borrow_mut().add(member);
        Ok(added)
    }

    /// Removes `member` from `owner.field` and returns it, if present.
    pub fn remove_member(
        &mut self,
        owner: &Entity,
        field: &str,
        member: &Entity,
    ) -> PersistResult<Option<Entity>> {
        let mut member = member.clone();
        self.adopt_if_saved(&mut member);
        let handle = self.collection(owner, field)?;
        let removed = handle.borrow_mut().remove(&member);
        Ok(removed)
    }

    /// Makes reconciliation of `owner.field` stamp children with the owner's
    /// `column` value instead of its identifier. Cleared by `reset`.
    pub fn override_back_reference(
        &mut self,
        owner: &Entity,
        field: &str,
        column: &str,
    ) -> PersistResult<()> {
        let schema = owner.schema();
        let FieldKind::OneToMany(_) = &schema.require_field(field)?.kind else {
            return Err(SchemaError::NotARelation {
                table: schema.table().to_string(),
                field: field.to_string(),
            }
            .into());
        };
        if !schema.require_field(column)?.kind.is_column() {
            return Err(SchemaError::NotAColumn {
                table: schema.table().to_string(),
                field: column.to_string(),
            }
            .into());
        }
        let key = RelationKey::new(self.instance_key(owner), field);
        self.back_reference_overrides.insert(key, column.to_string());
        Ok(())
    }

    pub(crate) fn rekey_overrides(&mut self, from: &InstanceKey, to: &InstanceKey) {
        let moved: Vec<RelationKey> = self
            .back_reference_overrides
            .keys()
            .filter(|key| &key.instance == from)
            .cloned()
            .collect();
        for key in moved {
            if let Some(column) = self.back_reference_overrides.remove(&key) {
                self.back_reference_overrides
                    .insert(RelationKey::new(to.clone(), key.field), column);
            }
        }
    }

    fn materialize(&mut self, owner: &Entity, field: &str) -> PersistResult<CollectionHandle> {
        let key = RelationKey::new(self.instance_key(owner), field);
        if let Some(handle) = self.relations.get(&key) {
            return Ok(handle);
        }

        let descriptor = owner.schema().require_field(field)?.clone();
        let owner_id = stored_id(&key.instance);
        if owner_id.is_some() {
            self.ensure_snapshot(owner)?;
        }

        let members = match (&descriptor.kind, owner_id) {
            (FieldKind::ForeignList { target }, _) => {
                let schema = self.registry.require(target)?;
                let mut members = Vec::new();
                for raw in parse_membership(owner.get(field)) {
                    let Ok(id) = Uuid::parse_str(&raw) else {
                        warn!("event=collection_load module=session status=skip field={field} member={raw} reason=invalid_id");
                        continue;
                    };
                    match self.store.select(&schema, id)? {
                        Some(member) => members.push(member),
                        None => warn!(
                            "event=collection_load module=session status=skip field={field} member={id} reason=vanished"
                        ),
                    }
                }
                members
            }
            (FieldKind::OneToMany(relation), Some(_)) => {
                let stamp = self.back_reference_value(owner, &key, relation)?;
                if stamp.is_null() {
                    Vec::new()
                } else {
                    let schema = self.registry.require(&relation.target)?;
                    self.store.select_where(
                        &schema,
                        &[Condition::eq(relation.back_reference.clone(), stamp)],
                    )?
                }
            }
            (FieldKind::ManyToMany(relation), Some(owner_id)) => {
                let schema = self.registry.require(&relation.target)?;
                let join_table = owner.schema().join_table(field, relation);
                let mut members = Vec::new();
                for id in self.store.select_associated(&join_table, owner_id)? {
                    match self.store.select(&schema, id)? {
                        Some(member) => members.push(member),
                        None => warn!(
                            "event=collection_load module=session status=skip field={field} member={id} reason=vanished"
                        ),
                    }
                }
                members
            }
            (FieldKind::OneToMany(_) | FieldKind::ManyToMany(_), None) => Vec::new(),
            (FieldKind::Scalar { .. } | FieldKind::ForeignKey { .. }, _) => {
                return Err(SchemaError::NotARelation {
                    table: owner.table().to_string(),
                    field: field.to_string(),
                }
                .into());
            }
        };

        for member in &members {
            self.adopt_row(member);
        }
        let collection = RelationCollection::new(field, members);
        if owner_id.is_some() && !descriptor.kind.is_column() {
            self.snapshots
                .update(&key.instance, field, collection.persisted_membership());
        }
        debug!(
            "event=collection_load module=session status=ok relation={key} members={}",
            collection.len()
        );

        let handle = Rc::new(RefCell::new(collection));
        self.relations.set(key, Rc::clone(&handle));
        Ok(handle)
    }

    /// Value written into a child's back-reference for `owner`.
    ///
    /// `Null` while the owner has no durable identity.
    fn back_reference_value(
        &self,
        owner: &Entity,
        key: &RelationKey,
        relation: &OneToMany,
    ) -> PersistResult<Value> {
        let column = self
            .back_reference_overrides
            .get(key)
            .or(relation.referenced_column.as_ref());
        if let Some(column) = column {
            return Ok(owner.get(column).clone());
        }
        let Some(owner_id) = stored_id(&key.instance) else {
            return Ok(Value::Null);
        };
        let child = self.registry.require(&relation.target)?;
        let back_reference = child.require_field(&relation.back_reference)?;
        Ok(match &back_reference.kind {
            FieldKind::ForeignKey { .. } => {
                Value::Ref(LazyRef::unresolved(owner.table(), owner_id))
            }
            _ => Value::Text(owner_id.to_string()),
        })
    }

    /// Saves transient list members and writes the persisted identifiers into
    /// the owner column.
    pub(crate) fn sync_foreign_lists(&mut self, owner: &mut Entity) -> PersistResult<()> {
        let instance = self.instance_key(owner);
        let fields: Vec<String> = owner
            .schema()
            .fields()
            .iter()
            .filter(|field| matches!(field.kind, FieldKind::ForeignList { .. }))
            .map(|field| field.name.clone())
            .collect();
        for field in fields {
            let Some(handle) = self.relations.get(&RelationKey::new(instance.clone(), &field)) else {
                continue;
            };
            self.journal(&handle);
            self.save_members(&handle, |member| Ok(member.is_transient()))?;
            let membership = handle.borrow().persisted_membership();
            owner.put(&field, membership);
        }
        Ok(())
    }

    /// Persists one-to-many then many-to-many collections of a just-written
    /// owner. Returns one trace event per collection whose persisted
    /// membership changed.
    pub(crate) fn reconcile_collections(&mut self, owner: &Entity) -> PersistResult<Vec<TraceEvent>> {
        let instance = self.instance_key(owner);
        let fields: Vec<FieldDescriptor> = owner
            .schema()
            .collections()
            .filter(|field| !field.kind.is_column())
            .cloned()
            .collect();
        let ordered = fields
            .iter()
            .filter(|field| matches!(field.kind, FieldKind::OneToMany(_)))
            .chain(
                fields
                    .iter()
                    .filter(|field| matches!(field.kind, FieldKind::ManyToMany(_))),
            );

        let mut events = Vec::new();
        for field in ordered {
            let key = RelationKey::new(instance.clone(), &field.name);
            let Some(handle) = self.relations.get(&key) else {
                continue;
            };
            self.journal(&handle);
            let baseline = self.snapshots.members(&instance, &field.name);
            match &field.kind {
                FieldKind::OneToMany(relation) => {
                    self.reconcile_one_to_many(owner, &key, relation, &handle, &baseline)?;
                }
                FieldKind::ManyToMany(relation) => {
                    self.reconcile_many_to_many(owner, &key, relation, &handle, &baseline)?;
                }
                _ => {}
            }
            let current = handle.borrow().persisted_keys();
            if let Some(event) = membership_change(&field.name, &current, &baseline) {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn reconcile_one_to_many(
        &mut self,
        owner: &Entity,
        key: &RelationKey,
        relation: &OneToMany,
        handle: &CollectionHandle,
        baseline: &BTreeSet<String>,
    ) -> PersistResult<()> {
        let stamp = self.back_reference_value(owner, key, relation)?;
        let child_schema = self.registry.require(&relation.target)?;

        let removed = handle.borrow().deleted(baseline);
        for member_key in removed {
            let stashed = handle.borrow_mut().take_removed(&member_key);
            let child = match (stashed, Uuid::parse_str(&member_key)) {
                (Some(child), _) => Some(child),
                (None, Ok(id)) => self.store.select(&child_schema, id)?,
                (None, Err(_)) => None,
            };
            let Some(mut child) = child else {
                warn!(
                    "event=collection_reconcile module=session status=skip relation={key} member={member_key} reason=vanished"
                );
                continue;
            };
            if relation.inverse {
                child.set(&relation.back_reference, Value::Null)?;
                self.save_entity(&mut child)?;
            } else {
                self.delete_entity(&mut child)?;
            }
        }

        let back_reference = relation.back_reference.clone();
        self.save_members(handle, |member| {
            member.set(&back_reference, stamp.clone())?;
            Ok(true)
        })?;
        Ok(())
    }

    fn reconcile_many_to_many(
        &mut self,
        owner: &Entity,
        key: &RelationKey,
        relation: &ManyToMany,
        handle: &CollectionHandle,
        baseline: &BTreeSet<String>,
    ) -> PersistResult<()> {
        let Some(owner_id) = stored_id(&key.instance) else {
            return Ok(());
        };
        let join_table = owner.schema().join_table(&key.field, relation);

        let removed = handle.borrow().deleted(baseline);
        for member_key in removed {
            handle.borrow_mut().take_removed(&member_key);
            if let Ok(member_id) = Uuid::parse_str(&member_key) {
                self.store
                    .delete_association(&join_table, owner_id, member_id)?;
            }
        }

        self.save_members(handle, |member| Ok(member.is_transient()))?;

        let added: Vec<EntityId> = handle
            .borrow()
            .members()
            .iter()
            .filter(|member| member.is_stored() && !baseline.contains(&member.member_key()))
            .filter_map(Entity::id)
            .collect();
        for member_id in added {
            self.store
                .insert_association(&join_table, owner_id, member_id)?;
        }
        Ok(())
    }

    /// Saves every member for which `prepare` returns `Ok(true)`, writing the
    /// saved copy back into the collection.
    ///
    /// `prepare` may mutate the member first. The collection is not borrowed
    /// while a member is being saved.
    fn save_members(
        &mut self,
        handle: &CollectionHandle,
        mut prepare: impl FnMut(&mut Entity) -> PersistResult<bool>,
    ) -> PersistResult<()> {
        let count = handle.borrow().len();
        for index in 0..count {
            let member = handle.borrow().members().get(index).cloned();
            let Some(mut member) = member else {
                break;
            };
            if !prepare(&mut member)? {
                continue;
            }
            self.save_entity(&mut member)?;
            if let Some(slot) = handle.borrow_mut().members_mut().get_mut(index) {
                *slot = member;
            }
        }
        Ok(())
    }

    /// Detaches inverse children, deletes owned children and drops join rows
    /// of an owner about to be deleted.
    pub(crate) fn release_children(&mut self, owner: &Entity) -> PersistResult<()> {
        let instance = self.instance_key(owner);
        let Some(owner_id) = stored_id(&instance) else {
            return Ok(());
        };
        let fields: Vec<FieldDescriptor> = owner.schema().fields().to_vec();
        let one_to_many: Vec<(&str, &OneToMany)> = fields
            .iter()
            .filter_map(|field| match &field.kind {
                FieldKind::OneToMany(relation) => Some((field.name.as_str(), relation)),
                _ => None,
            })
            .collect();

        for inverse in [true, false] {
            for (field, relation) in one_to_many.iter().filter(|(_, r)| r.inverse == inverse) {
                let key = RelationKey::new(instance.clone(), *field);
                for mut child in self.stored_children(owner, &key, relation)? {
                    self.adopt_row(&child);
                    if inverse {
                        child.set(&relation.back_reference, Value::Null)?;
                        self.save_entity(&mut child)?;
                    } else {
                        self.delete_entity(&mut child)?;
                    }
                }
            }
        }

        for field in &fields {
            let FieldKind::ManyToMany(relation) = &field.kind else {
                continue;
            };
            let join_table = owner.schema().join_table(&field.name, relation);
            for member_id in self.store.select_associated(&join_table, owner_id)? {
                self.store
                    .delete_association(&join_table, owner_id, member_id)?;
            }
        }
        Ok(())
    }

    /// Old values of every non-empty relationship of an owner being deleted.
    pub(crate) fn collection_deletion_events(&mut self, owner: &Entity) -> PersistResult<Vec<TraceEvent>> {
        let instance = self.instance_key(owner);
        let fields: Vec<String> = owner
            .schema()
            .collections()
            .filter(|field| !field.kind.is_column())
            .map(|field| field.name.clone())
            .collect();
        let mut events = Vec::new();
        for field in fields {
            self.materialize(owner, &field)?;
            let old = membership_value(self.snapshots.members(&instance, &field));
            if !old.is_null() {
                events.push(TraceEvent::new(field, old, Value::Null));
            }
        }
        Ok(events)
    }

    fn stored_children(
        &self,
        owner: &Entity,
        key: &RelationKey,
        relation: &OneToMany,
    ) -> PersistResult<Vec<Entity>> {
        let stamp = self.back_reference_value(owner, key, relation)?;
        if stamp.is_null() {
            return Ok(Vec::new());
        }
        let schema = self.registry.require(&relation.target)?;
        Ok(self.store.select_where(
            &schema,
            &[Condition::eq(relation.back_reference.clone(), stamp)],
        )?)
    }
}

fn stored_id(instance: &InstanceKey) -> Option<EntityId> {
    match instance {
        InstanceKey::Stored { id, .. } => Some(*id),
        InstanceKey::Transient(_) => None,
    }
}

fn relation_target(owner: &Entity, field: &str) -> PersistResult<String> {
    match &owner.schema().require_field(field)?.kind {
        FieldKind::ForeignList { target } => Ok(target.clone()),
        FieldKind::OneToMany(relation) => Ok(relation.target.clone()),
        FieldKind::ManyToMany(relation) => Ok(relation.target.clone()),
        FieldKind::Scalar { .. } | FieldKind::ForeignKey { .. } => Err(SchemaError::NotARelation {
            table: owner.table().to_string(),
            field: field.to_string(),
        }
        .into()),
    }
}
