//! Session: per-request unit-of-work context around one storage backend.
//!
//! # Responsibility
//! - Own the snapshot store and relationship cache of one request.
//! - Demarcate one logical transaction per lifecycle operation; nested
//!   operations join the outermost one.
//! - Restore in-memory state when a unit of work rolls back.
//!
//! # Invariants
//! - `begin` is issued exactly once per outermost unit; every begun unit ends
//!   in exactly one `commit` or `rollback`.
//! - Audit records are delivered inside the transaction, right before commit,
//!   and discarded on rollback.
//! - Failures are recorded to the error sink once, at the outermost boundary.
//!
//! # See also
//! - `session::lifecycle` for Save/Delete/Refresh/Reset.
//! - `session::relations` for collection reconciliation.

use crate::audit::{AuditSink, ChangeKind, ErrorSink, TraceEvent};
use crate::model::entity::{Entity, EntityId, InstanceKey};
use crate::model::schema::{SchemaError, SchemaRegistry};
use crate::model::value::ReferenceResolver;
use crate::repo::{StorageBackend, StoreError};
use crate::tracking::{CollectionHandle, RelationCollection, RelationKey, RelationshipCache, SnapshotStore};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::rc::Rc;

pub mod hooks;
pub mod lifecycle;
pub mod relations;
pub mod trace;
pub mod validate;

pub use hooks::{HookError, HookStage, LifecycleHooks};
pub use lifecycle::{BulkInsertReport, DeleteOutcome, RefreshOutcome, SaveOutcome};
pub use validate::{FailureReason, FieldFailure, ValidationReport};

pub type PersistResult<T> = Result<T, PersistError>;

/// Failure of a session operation.
#[derive(Debug)]
pub enum PersistError {
    Store(StoreError),
    Schema(SchemaError),
    Hook {
        table: String,
        stage: HookStage,
        source: HookError,
    },
}

impl PersistError {
    /// Stable code used in log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(StoreError::NotFound { .. }) => "row_not_found",
            Self::Store(_) => "store_failed",
            Self::Schema(_) => "schema_invalid",
            Self::Hook { .. } => "hook_failed",
        }
    }
}

impl Display for PersistError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::Schema(err) => write!(f, "{err}"),
            Self::Hook {
                table,
                stage,
                source,
            } => write!(f, "{} hook of `{table}` failed: {source}", stage.as_str()),
        }
    }
}

impl Error for PersistError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Schema(err) => Some(err),
            Self::Hook { source, .. } => Some(source),
        }
    }
}

impl From<StoreError> for PersistError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<SchemaError> for PersistError {
    fn from(value: SchemaError) -> Self {
        Self::Schema(value)
    }
}

/// Session behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Include relationship changes in audit records.
    pub audit_collections: bool,
    /// Skip audit delivery entirely.
    pub audit_suspended: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audit_collections: true,
            audit_suspended: false,
        }
    }
}

struct PendingAudit {
    entity: Entity,
    kind: ChangeKind,
    events: Vec<TraceEvent>,
}

/// In-memory state captured when the outermost unit begins.
struct Checkpoint {
    snapshots: SnapshotStore,
    relations: RelationshipCache,
    overrides: HashMap<RelationKey, String>,
    adopted: HashMap<u64, EntityId>,
    invalid: Vec<ValidationReport>,
}

#[derive(Default)]
struct UnitOfWork {
    depth: usize,
    checkpoint: Option<Checkpoint>,
    /// Collections mutated by reconciliation, with their pre-unit contents.
    journal: Vec<(CollectionHandle, RelationCollection)>,
    /// Instance tokens currently being saved.
    saving: HashSet<u64>,
    pending_audit: Vec<PendingAudit>,
    deferred_after_delete: Vec<Entity>,
}

pub struct Session<'a> {
    store: &'a dyn StorageBackend,
    audit: &'a dyn AuditSink,
    errors: &'a dyn ErrorSink,
    registry: &'a SchemaRegistry,
    config: SessionConfig,
    snapshots: SnapshotStore,
    relations: RelationshipCache,
    back_reference_overrides: HashMap<RelationKey, String>,
    /// Instance token to durable id, for transient clones of saved instances.
    adopted: HashMap<u64, EntityId>,
    hooks: HashMap<String, Vec<Box<dyn LifecycleHooks + 'a>>>,
    invalid: Vec<ValidationReport>,
    unit: UnitOfWork,
}

impl<'a> Session<'a> {
    /// Creates a session after validating the registry's cross references.
    pub fn try_new(
        store: &'a dyn StorageBackend,
        audit: &'a dyn AuditSink,
        errors: &'a dyn ErrorSink,
        registry: &'a SchemaRegistry,
    ) -> PersistResult<Self> {
        registry.validate()?;
        Ok(Self {
            store,
            audit,
            errors,
            registry,
            config: SessionConfig::default(),
            snapshots: SnapshotStore::new(),
            relations: RelationshipCache::new(),
            back_reference_overrides: HashMap::new(),
            adopted: HashMap::new(),
            hooks: HashMap::new(),
            invalid: Vec::new(),
            unit: UnitOfWork::default(),
        })
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        self.registry
    }

    /// Registers hooks for every entity of `table`; hooks run in
    /// registration order.
    pub fn register_hooks(&mut self, table: impl Into<String>, hooks: Box<dyn LifecycleHooks + 'a>) {
        self.hooks.entry(table.into()).or_default().push(hooks);
    }

    pub fn suspend_audit(&mut self) {
        self.config.audit_suspended = true;
    }

    pub fn resume_audit(&mut self) {
        self.config.audit_suspended = false;
    }

    /// Entities whose last save failed foreign-key validation.
    pub fn invalid_entities(&self) -> &[ValidationReport] {
        &self.invalid
    }

    pub fn clear_invalid(&mut self) {
        self.invalid.clear();
    }

    /// Runs `work` as one unit of work; operations inside join it.
    pub fn transaction<T>(
        &mut self,
        work: impl FnOnce(&mut Self) -> PersistResult<T>,
    ) -> PersistResult<T> {
        self.in_unit_of_work("transaction", work)
    }

    /// Whether a unit of work is open.
    pub fn in_transaction(&self) -> bool {
        self.unit.depth > 0
    }

    /// Snapshot/cache key of `entity`, following transient clones of
    /// instances saved earlier in this session.
    pub(crate) fn instance_key(&self, entity: &Entity) -> InstanceKey {
        if entity.is_transient() {
            if let Some(id) = self.adopted.get(&entity.token()) {
                return InstanceKey::Stored {
                    table: entity.table().to_string(),
                    id: *id,
                };
            }
        }
        entity.instance_key()
    }

    pub(crate) fn in_unit_of_work<T>(
        &mut self,
        operation: &'static str,
        work: impl FnOnce(&mut Self) -> PersistResult<T>,
    ) -> PersistResult<T> {
        let outermost = self.unit.depth == 0;
        if outermost {
            if let Err(err) = self.store.begin() {
                let err = PersistError::from(err);
                self.errors.record(operation, &err);
                return Err(err);
            }
            self.unit.checkpoint = Some(Checkpoint {
                snapshots: self.snapshots.clone(),
                relations: self.relations.clone(),
                overrides: self.back_reference_overrides.clone(),
                adopted: self.adopted.clone(),
                invalid: self.invalid.clone(),
            });
            debug!("event={operation} module=session status=begin");
        }

        self.unit.depth += 1;
        let result = work(self);
        self.unit.depth -= 1;
        if !outermost {
            return result;
        }

        let result = result.and_then(|value| {
            self.flush_audit()?;
            self.store.commit()?;
            Ok(value)
        });
        match result {
            Ok(value) => {
                self.finish_committed();
                debug!("event={operation} module=session status=commit");
                Ok(value)
            }
            Err(err) => {
                self.finish_rolled_back(operation);
                self.errors.record(operation, &err);
                Err(err)
            }
        }
    }

    /// Records the pre-unit contents of a collection about to be mutated.
    pub(crate) fn journal(&mut self, handle: &CollectionHandle) {
        if self
            .unit
            .journal
            .iter()
            .any(|(journaled, _)| Rc::ptr_eq(journaled, handle))
        {
            return;
        }
        let saved = handle.borrow().clone();
        self.unit.journal.push((Rc::clone(handle), saved));
    }

    pub(crate) fn queue_audit(&mut self, entity: &Entity, kind: ChangeKind, events: Vec<TraceEvent>) {
        if self.config.audit_suspended {
            return;
        }
        self.unit.pending_audit.push(PendingAudit {
            entity: entity.clone(),
            kind,
            events,
        });
    }

    pub(crate) fn defer_after_delete(&mut self, entity: &Entity) {
        self.unit.deferred_after_delete.push(entity.clone());
    }

    pub(crate) fn hooks_for(&self, table: &str) -> &[Box<dyn LifecycleHooks + 'a>] {
        self.hooks.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Marks `token` as being saved; `false` when it already is.
    pub(crate) fn enter_save(&mut self, token: u64) -> bool {
        self.unit.saving.insert(token)
    }

    pub(crate) fn leave_save(&mut self, token: u64) {
        self.unit.saving.remove(&token);
    }

    pub(crate) fn record_invalid(&mut self, report: ValidationReport) {
        self.invalid.retain(|existing| existing.instance != report.instance);
        self.invalid.push(report);
    }

    pub(crate) fn clear_invalid_for(&mut self, instance: &InstanceKey) {
        self.invalid.retain(|existing| &existing.instance != instance);
    }

    pub(crate) fn adopt_token(&mut self, token: u64, id: EntityId) {
        self.adopted.insert(token, id);
    }

    pub(crate) fn adopted_id(&self, token: u64) -> Option<EntityId> {
        self.adopted.get(&token).copied()
    }

    /// Records a failure of a non-transactional operation. Inside a unit of
    /// work the error is left for the outermost boundary to record.
    pub(crate) fn observe<T>(&self, operation: &str, result: PersistResult<T>) -> PersistResult<T> {
        if self.in_transaction() {
            return result;
        }
        if let Err(err) = &result {
            self.errors.record(operation, err);
        }
        result
    }

    fn flush_audit(&mut self) -> PersistResult<()> {
        for pending in std::mem::take(&mut self.unit.pending_audit) {
            self.audit
                .record(&pending.entity, pending.kind, &pending.events)?;
        }
        Ok(())
    }

    fn finish_committed(&mut self) {
        self.unit.checkpoint = None;
        self.unit.saving.clear();
        for (handle, _) in std::mem::take(&mut self.unit.journal) {
            handle.borrow_mut().clear_removed();
        }
        for entity in std::mem::take(&mut self.unit.deferred_after_delete) {
            for hooks in self.hooks_for(entity.table()) {
                hooks.after_delete(&entity);
            }
        }
    }

    fn finish_rolled_back(&mut self, operation: &str) {
        if let Err(err) = self.store.rollback() {
            warn!("event={operation} module=session status=error error_code=rollback_failed error={err}");
        }
        if let Some(checkpoint) = self.unit.checkpoint.take() {
            self.snapshots = checkpoint.snapshots;
            self.relations = checkpoint.relations;
            self.back_reference_overrides = checkpoint.overrides;
            self.adopted = checkpoint.adopted;
            self.invalid = checkpoint.invalid;
        }
        for (handle, saved) in std::mem::take(&mut self.unit.journal) {
            *handle.borrow_mut() = saved;
        }
        self.unit.saving.clear();
        self.unit.pending_audit.clear();
        self.unit.deferred_after_delete.clear();
        debug!("event={operation} module=session status=rollback");
    }
}

impl ReferenceResolver for Session<'_> {
    fn resolve_reference(&mut self, table: &str, id: EntityId) -> PersistResult<Option<Entity>> {
        self.load(table, id)
    }
}
