//! Active-record persistence core: snapshot change tracking, relationship
//! collections and lifecycle orchestration over a pluggable storage backend.

pub mod audit;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod session;
pub mod tracking;

pub use audit::{
    AuditRecord, AuditSink, ChangeKind, ErrorSink, LogErrorSink, MemoryAuditLog, SqliteAuditLog,
    TraceEvent,
};
pub use db::{open_db, open_db_in_memory, schema_version, DbError};
pub use logging::{default_log_level, init_logging, logging_status, LoggingConfig, LoggingError};
pub use model::entity::{same_identity, Entity, EntityId, EntityState, InstanceKey, KeyMode};
pub use model::schema::{
    EntitySchema, FieldKind, ManyToMany, OneToMany, ScalarType, SchemaError, SchemaRegistry,
};
pub use model::value::{LazyRef, ReferenceResolver, Value};
pub use repo::{Condition, SqliteBackend, StorageBackend, StoreError, StoreResult};
pub use session::{
    BulkInsertReport, DeleteOutcome, FailureReason, HookError, HookStage, LifecycleHooks,
    PersistError, PersistResult, RefreshOutcome, SaveOutcome, Session, SessionConfig,
    ValidationReport,
};
pub use tracking::{CollectionHandle, RelationCollection, RelationKey};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
