//! Entity lifecycle: Save, Delete, Refresh, Reset and the read paths.
//!
//! # Invariants
//! - `transient -> stored -> deleted`; deleted is terminal.
//! - Save validates foreign keys before any write; an invalid entity is
//!   reported, never written.
//! - A stored entity is updated with its changed columns only; an unchanged
//!   one causes no write and no audit record.
//! - Public Save/Delete/BulkInsert restore the caller's entities when the
//!   unit of work rolls back.

use crate::audit::ChangeKind;
use crate::model::entity::{Entity, EntityId, InstanceKey};
use crate::model::schema::FieldKind;
use crate::repo::Condition;
use crate::session::hooks::HookStage;
use crate::session::trace::{column_changes, comparable, creation_events, deletion_events};
use crate::session::validate::{validate_foreign_keys, ValidationReport};
use crate::session::{PersistError, PersistResult, Session};
use crate::tracking::{RelationKey, Snapshot};
use log::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Row inserted.
    Created,
    /// Columns or relationships written.
    Updated,
    /// Nothing differed from the snapshot.
    Unchanged,
    /// Foreign-key validation failed; nothing was written.
    Invalid(ValidationReport),
    /// Deleted entity, or an instance already being saved in this unit.
    Skipped,
}

impl SaveOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Invalid(_) => "invalid",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Entity was never persisted (or already deleted).
    NotStored,
    /// Row was already gone from storage.
    Vanished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    NotStored,
    Vanished,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkInsertReport {
    pub inserted: usize,
    pub invalid: Vec<ValidationReport>,
}

impl Session<'_> {
    /// Persists `entity` and its initialized collections as one unit of work.
    pub fn save(&mut self, entity: &mut Entity) -> PersistResult<SaveOutcome> {
        let before = (!self.in_transaction()).then(|| entity.clone());
        let result = self.in_unit_of_work("entity_save", |session| session.save_entity(entity));
        if result.is_err() {
            if let Some(before) = before {
                *entity = before;
            }
        }
        result
    }

    /// Deletes `entity`, detaching inverse children and deleting owned ones.
    pub fn delete(&mut self, entity: &mut Entity) -> PersistResult<DeleteOutcome> {
        let before = (!self.in_transaction()).then(|| entity.clone());
        let result = self.in_unit_of_work("entity_delete", |session| session.delete_entity(entity));
        if result.is_err() {
            if let Some(before) = before {
                *entity = before;
            }
        }
        result
    }

    /// Re-reads the row bypassing caches, replaces the snapshot, then resets.
    pub fn refresh(&mut self, entity: &mut Entity) -> PersistResult<RefreshOutcome> {
        let result = self.refresh_entity(entity);
        self.observe("entity_refresh", result)
    }

    /// Restores columns from the snapshot and drops cached collections and
    /// back-reference overrides of the instance.
    pub fn reset(&mut self, entity: &mut Entity) {
        let key = self.instance_key(entity);
        if let Some(snapshot) = self.snapshots.get(&key) {
            let columns: Vec<String> = entity
                .schema()
                .columns()
                .map(|field| field.name.clone())
                .collect();
            for column in columns {
                let value = snapshot.value(&column).cloned().unwrap_or_default();
                entity.put(&column, value);
            }
        }
        let evicted = self.relations.evict_instance(&key);
        self.back_reference_overrides
            .retain(|relation, _| relation.instance != key);
        debug!("event=entity_reset module=session status=ok instance={key} evicted={evicted}");
    }

    /// Reads one row and adopts it as the snapshot.
    pub fn load(&mut self, table: &str, id: EntityId) -> PersistResult<Option<Entity>> {
        let result = self.load_row(table, id);
        self.observe("entity_load", result)
    }

    /// Reads every row matching all `conditions` and adopts their snapshots.
    pub fn find_where(&mut self, table: &str, conditions: &[Condition]) -> PersistResult<Vec<Entity>> {
        let result = self.find_rows(table, conditions);
        self.observe("entity_find", result)
    }

    /// Inserts every valid transient entity with one backend call.
    ///
    /// No hooks run and no audit is produced. Invalid entities are skipped and
    /// reported; already stored or deleted entities are ignored.
    pub fn bulk_insert(&mut self, entities: &mut [Entity]) -> PersistResult<BulkInsertReport> {
        let before = (!self.in_transaction()).then(|| entities.to_vec());
        let result =
            self.in_unit_of_work("entity_bulk_insert", |session| session.bulk_insert_entities(entities));
        if result.is_err() {
            if let Some(before) = before {
                entities.clone_from_slice(&before);
            }
        }
        result
    }

    /// Whether any column or initialized collection differs from the
    /// snapshot. Transient entities are always dirty.
    pub fn is_dirty(&mut self, entity: &Entity) -> PersistResult<bool> {
        if entity.is_deleted() {
            return Ok(false);
        }
        let key = self.instance_key(entity);
        if !matches!(key, InstanceKey::Stored { .. }) {
            return Ok(true);
        }
        let result = self.trace(entity, true).map(|events| !events.is_empty());
        self.observe("entity_is_dirty", result)
    }

    pub(crate) fn save_entity(&mut self, entity: &mut Entity) -> PersistResult<SaveOutcome> {
        if entity.is_deleted() {
            return Ok(SaveOutcome::Skipped);
        }
        let token = entity.token();
        if !self.enter_save(token) {
            debug!(
                "event=entity_save module=session status=skip table={} reason=reentrant",
                entity.table()
            );
            return Ok(SaveOutcome::Skipped);
        }
        let result = self.save_steps(entity);
        self.leave_save(token);
        result
    }

    fn save_steps(&mut self, entity: &mut Entity) -> PersistResult<SaveOutcome> {
        self.registry.require(entity.table())?;
        self.adopt_if_saved(entity);

        let created = entity.is_transient();
        let transient_key = entity.instance_key();
        if created && entity.id().is_none() {
            entity.assign_id(Uuid::new_v4());
        }

        self.run_before_save(entity)?;
        self.rebind_adopted_references(entity);

        if let Err(report) = validate_foreign_keys(entity) {
            warn!(
                "event=entity_save module=session status=invalid table={} report=\"{report}\"",
                entity.table()
            );
            self.record_invalid(report.clone());
            return Ok(SaveOutcome::Invalid(report));
        }
        self.clear_invalid_for(&transient_key);

        self.sync_foreign_lists(entity)?;

        let audit_lists = self.config.audit_collections;
        let (mut events, columns_written) = if created {
            self.store.insert(entity)?;
            (creation_events(entity, audit_lists), true)
        } else {
            self.ensure_snapshot(entity)?;
            let key = self.instance_key(entity);
            let snapshot = self.snapshots.get(&key).cloned().unwrap_or_default();
            let dirty = column_changes(entity, &snapshot, true);
            if !dirty.is_empty() {
                let changed: Vec<&str> = dirty.iter().map(|event| event.property.as_str()).collect();
                self.store.update(entity, &changed)?;
            }
            (column_changes(entity, &snapshot, audit_lists), !dirty.is_empty())
        };

        if created {
            entity.mark_stored();
            let stored_key = entity.instance_key();
            self.relations.rekey(&transient_key, &stored_key);
            self.rekey_overrides(&transient_key, &stored_key);
            if let Some(id) = entity.id() {
                self.adopt_token(entity.token(), id);
            }
        }

        self.run_after_save(entity)?;
        let membership_events = self.reconcile_collections(entity)?;
        self.capture_after_save(entity, created);

        let relations_written = !membership_events.is_empty();
        if audit_lists {
            events.extend(membership_events);
        }

        let outcome = if created {
            self.queue_audit(entity, ChangeKind::Created, events);
            SaveOutcome::Created
        } else if columns_written || relations_written {
            if !events.is_empty() {
                self.queue_audit(entity, ChangeKind::Updated, events);
            }
            SaveOutcome::Updated
        } else {
            SaveOutcome::Unchanged
        };

        info!(
            "event=entity_save module=session status=ok table={} id={} outcome={}",
            entity.table(),
            entity.member_key(),
            outcome.as_str()
        );
        Ok(outcome)
    }

    pub(crate) fn delete_entity(&mut self, entity: &mut Entity) -> PersistResult<DeleteOutcome> {
        self.adopt_if_saved(entity);
        let (true, Some(id)) = (entity.is_stored(), entity.id()) else {
            return Ok(DeleteOutcome::NotStored);
        };
        let key = self.instance_key(entity);

        for hooks in self.hooks_for(entity.table()) {
            hooks
                .before_delete(entity)
                .map_err(|source| PersistError::Hook {
                    table: entity.table().to_string(),
                    stage: HookStage::BeforeDelete,
                    source,
                })?;
        }

        let audit_lists = self.config.audit_collections;
        let mut events = deletion_events(entity, audit_lists);
        if audit_lists {
            events.extend(self.collection_deletion_events(entity)?);
        }

        self.release_children(entity)?;
        let removed = self.store.delete(entity.schema(), id)?;

        entity.mark_deleted();
        self.snapshots.remove(&key);
        self.relations.evict_instance(&key);
        self.back_reference_overrides
            .retain(|relation, _| relation.instance != key);
        self.clear_invalid_for(&key);

        if !removed {
            warn!(
                "event=entity_delete module=session status=skip table={} id={id} reason=vanished",
                entity.table()
            );
            return Ok(DeleteOutcome::Vanished);
        }

        self.queue_audit(entity, ChangeKind::Deleted, events);
        self.defer_after_delete(entity);
        info!(
            "event=entity_delete module=session status=ok table={} id={id}",
            entity.table()
        );
        Ok(DeleteOutcome::Deleted)
    }

    /// Adopts a freshly read row, keeping relationship baselines of
    /// collections that stay cached.
    pub(crate) fn adopt_row(&mut self, row: &Entity) {
        let key = row.instance_key();
        let mut snapshot = Snapshot::capture(row);
        if let Some(previous) = self.snapshots.get(&key) {
            for field in row.schema().collections() {
                if field.kind.is_column() {
                    continue;
                }
                let cached = self
                    .relations
                    .contains(&RelationKey::new(key.clone(), &field.name));
                if let (true, Some(value)) = (cached, previous.value(&field.name)) {
                    snapshot.set(&field.name, value.clone());
                }
            }
        }
        self.snapshots.replace(key, snapshot);
    }

    /// Loads and adopts the row of a stored entity that has no snapshot yet.
    ///
    /// Returns whether a snapshot exists afterwards.
    pub(crate) fn ensure_snapshot(&mut self, entity: &Entity) -> PersistResult<bool> {
        let key = self.instance_key(entity);
        let InstanceKey::Stored { id, .. } = &key else {
            return Ok(false);
        };
        if self.snapshots.contains(&key) {
            return Ok(true);
        }
        match self.store.select(entity.schema(), *id)? {
            Some(row) => {
                self.snapshots.replace(key, Snapshot::capture(&row));
                Ok(true)
            }
            None => {
                warn!(
                    "event=snapshot_load module=session status=skip table={} id={id} reason=vanished",
                    entity.table()
                );
                Ok(false)
            }
        }
    }

    /// Turns a transient clone of an instance saved earlier into a stored one.
    pub(crate) fn adopt_if_saved(&self, entity: &mut Entity) {
        if !entity.is_transient() {
            return;
        }
        if let Some(id) = self.adopted_id(entity.token()) {
            entity.assign_id(id);
            entity.mark_stored();
        }
    }

    fn refresh_entity(&mut self, entity: &mut Entity) -> PersistResult<RefreshOutcome> {
        self.adopt_if_saved(entity);
        let (true, Some(id)) = (entity.is_stored(), entity.id()) else {
            return Ok(RefreshOutcome::NotStored);
        };
        let Some(row) = self.store.select(entity.schema(), id)? else {
            warn!(
                "event=entity_refresh module=session status=skip table={} id={id} reason=vanished",
                entity.table()
            );
            return Ok(RefreshOutcome::Vanished);
        };
        self.snapshots
            .replace(entity.instance_key(), Snapshot::capture(&row));
        self.reset(entity);
        Ok(RefreshOutcome::Refreshed)
    }

    fn load_row(&mut self, table: &str, id: EntityId) -> PersistResult<Option<Entity>> {
        let schema = self.registry.require(table)?;
        let row = self.store.select(&schema, id)?;
        if let Some(row) = &row {
            self.adopt_row(row);
        }
        Ok(row)
    }

    fn find_rows(&mut self, table: &str, conditions: &[Condition]) -> PersistResult<Vec<Entity>> {
        let schema = self.registry.require(table)?;
        let rows = self.store.select_where(&schema, conditions)?;
        for row in &rows {
            self.adopt_row(row);
        }
        Ok(rows)
    }

    fn bulk_insert_entities(&mut self, entities: &mut [Entity]) -> PersistResult<BulkInsertReport> {
        let mut report = BulkInsertReport::default();
        let mut ready = Vec::new();
        for (index, entity) in entities.iter_mut().enumerate() {
            self.adopt_if_saved(entity);
            if !entity.is_transient() {
                continue;
            }
            self.registry.require(entity.table())?;
            if entity.id().is_none() {
                entity.assign_id(Uuid::new_v4());
            }
            self.rebind_adopted_references(entity);
            match validate_foreign_keys(entity) {
                Ok(()) => ready.push(index),
                Err(validation) => {
                    self.record_invalid(validation.clone());
                    report.invalid.push(validation);
                }
            }
        }

        let batch: Vec<&Entity> = ready.iter().map(|index| &entities[*index]).collect();
        report.inserted = self.store.bulk_insert(&batch)?;

        for index in ready {
            let entity = &mut entities[index];
            let transient_key = entity.instance_key();
            entity.mark_stored();
            let stored_key = entity.instance_key();
            self.relations.rekey(&transient_key, &stored_key);
            if let Some(id) = entity.id() {
                self.adopt_token(entity.token(), id);
            }
            self.snapshots.replace(stored_key, Snapshot::capture(entity));
        }

        info!(
            "event=entity_bulk_insert module=session status=ok inserted={} invalid={}",
            report.inserted,
            report.invalid.len()
        );
        Ok(report)
    }

    /// Refreshes the snapshot after a successful write.
    fn capture_after_save(&mut self, entity: &Entity, created: bool) {
        let key = self.instance_key(entity);
        if created {
            self.snapshots.replace(key.clone(), Snapshot::capture(entity));
        } else {
            for field in entity.schema().columns() {
                self.snapshots.update(
                    &key,
                    &field.name,
                    comparable(&field.kind, entity.get(&field.name)),
                );
            }
        }
        for field in entity.schema().collections() {
            if field.kind.is_column() {
                continue;
            }
            if let Some(handle) = self.relations.get(&RelationKey::new(key.clone(), &field.name)) {
                let membership = handle.borrow().persisted_membership();
                self.snapshots.update(&key, &field.name, membership);
            }
        }
    }

    /// Marks resolved reference targets saved earlier in this session as
    /// stored, so clones taken before their save still validate.
    fn rebind_adopted_references(&self, entity: &mut Entity) {
        let fields: Vec<String> = entity
            .schema()
            .fields()
            .iter()
            .filter(|field| matches!(field.kind, FieldKind::ForeignKey { .. }))
            .map(|field| field.name.clone())
            .collect();
        for field in fields {
            let Some(target) = entity
                .reference_mut(&field)
                .and_then(|reference| reference.resolved_mut())
            else {
                continue;
            };
            self.adopt_if_saved(target);
        }
    }

    fn run_before_save(&self, entity: &mut Entity) -> PersistResult<()> {
        let table = entity.table().to_string();
        for hooks in self.hooks_for(&table) {
            hooks
                .before_save(entity)
                .map_err(|source| PersistError::Hook {
                    table: table.clone(),
                    stage: HookStage::BeforeSave,
                    source,
                })?;
        }
        Ok(())
    }

    fn run_after_save(&self, entity: &Entity) -> PersistResult<()> {
        for hooks in self.hooks_for(entity.table()) {
            hooks
                .after_save(entity)
                .map_err(|source| PersistError::Hook {
                    table: entity.table().to_string(),
                    stage: HookStage::AfterSave,
                    source,
                })?;
        }
        Ok(())
    }
}
