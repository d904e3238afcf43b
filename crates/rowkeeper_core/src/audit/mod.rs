//! Audit and error sinks.
//!
//! # Responsibility
//! - Define where change records and operation failures are delivered.
//! - Provide an in-memory audit sink, a SQLite audit sink and a log-backed
//!   error sink.
//!
//! # Invariants
//! - Audit delivery is fallible; a failing sink fails the surrounding unit of
//!   work.
//! - Error sinks are infallible and never panic.

use crate::model::entity::{Entity, EntityId};
use crate::model::value::Value;
use crate::repo::StoreResult;
use crate::session::PersistError;
use log::error;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt::{Display, Formatter};

pub mod sqlite_log;

pub use sqlite_log::SqliteAuditLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One changed property: `(property, old, new)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    pub property: String,
    pub old: Value,
    pub new: Value,
}

impl TraceEvent {
    pub fn new(property: impl Into<String>, old: Value, new: Value) -> Self {
        Self {
            property: property.into(),
            old,
            new,
        }
    }
}

/// Receives change records produced by save and delete.
pub trait AuditSink {
    fn record(&self, entity: &Entity, kind: ChangeKind, events: &[TraceEvent]) -> StoreResult<()>;
}

/// Receives failures of lifecycle operations.
pub trait ErrorSink {
    fn record(&self, operation: &str, error: &PersistError);
}

/// Audit record retained by `MemoryAuditLog`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub table: String,
    pub entity_id: Option<EntityId>,
    pub kind: ChangeKind,
    pub events: Vec<TraceEvent>,
}

impl AuditRecord {
    /// Event for `property`, if this record has one.
    pub fn event(&self, property: &str) -> Option<&TraceEvent> {
        self.events.iter().find(|event| event.property == property)
    }
}

/// Audit sink that keeps records in memory, in delivery order.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: RefCell<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.records.borrow_mut().clear();
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, entity: &Entity, kind: ChangeKind, events: &[TraceEvent]) -> StoreResult<()> {
        self.records.borrow_mut().push(AuditRecord {
            table: entity.table().to_string(),
            entity_id: entity.id(),
            kind,
            events: events.to_vec(),
        });
        Ok(())
    }
}

/// Error sink writing one `error` log line per failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn record(&self, operation: &str, error: &PersistError) {
        error!(
            "event={operation} module=session status=error error_code={} error={error}",
            error.code()
        );
    }
}
