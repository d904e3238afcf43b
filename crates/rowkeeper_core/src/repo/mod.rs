//! Storage backend contract and SQLite implementation.
//!
//! # Responsibility
//! - Define the narrow storage interface the session drives.
//! - Isolate SQL details from lifecycle orchestration.
//!
//! # Invariants
//! - Backends never decide what is dirty; they write exactly what they are
//!   handed.
//! - `update` reports a missing row as `StoreError::NotFound`, not as success.
//!
//! # See also
//! - `session` for transaction demarcation.

use crate::db::DbError;
use crate::model::entity::{Entity, EntityId};
use crate::model::schema::{EntitySchema, SchemaError};
use crate::model::value::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub mod sqlite_backend;

pub use sqlite_backend::SqliteBackend;

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage-level failure.
#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    Schema(SchemaError),
    NotFound { table: String, id: EntityId },
    InvalidData(String),
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Schema(err) => write!(f, "{err}"),
            Self::NotFound { table, id } => write!(f, "row not found: {table}/{id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "connection schema version {actual_version} does not match expected {expected_version}"
            ),
            Self::MissingRequiredTable(table) => write!(f, "missing required table `{table}`"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Schema(err) => Some(err),
            Self::NotFound { .. }
            | Self::InvalidData(_)
            | Self::UninitializedConnection { .. }
            | Self::MissingRequiredTable(_) => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<SchemaError> for StoreError {
    fn from(value: SchemaError) -> Self {
        Self::Schema(value)
    }
}

/// Equality filter for `select_where`; `Null` matches `IS NULL`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub value: Value,
}

impl Condition {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Storage operations the session needs.
///
/// Methods take `&self`; implementations own their interior state (a borrowed
/// connection for SQLite).
pub trait StorageBackend {
    fn begin(&self) -> StoreResult<()>;
    fn commit(&self) -> StoreResult<()>;
    fn rollback(&self) -> StoreResult<()>;

    /// Inserts a row for an entity that already carries its identifier.
    fn insert(&self, entity: &Entity) -> StoreResult<()>;
    /// Writes only the listed columns.
    fn update(&self, entity: &Entity, changed: &[&str]) -> StoreResult<()>;
    /// Returns whether a row was removed.
    fn delete(&self, schema: &EntitySchema, id: EntityId) -> StoreResult<bool>;

    fn select(&self, schema: &Arc<EntitySchema>, id: EntityId) -> StoreResult<Option<Entity>>;
    fn select_where(
        &self,
        schema: &Arc<EntitySchema>,
        conditions: &[Condition],
    ) -> StoreResult<Vec<Entity>>;

    fn select_associated(&self, join_table: &str, owner_id: EntityId)
        -> StoreResult<Vec<EntityId>>;
    fn insert_association(
        &self,
        join_table: &str,
        owner_id: EntityId,
        member_id: EntityId,
    ) -> StoreResult<()>;
    fn delete_association(
        &self,
        join_table: &str,
        owner_id: EntityId,
        member_id: EntityId,
    ) -> StoreResult<bool>;

    /// Inserts many rows in one call; returns the number written.
    fn bulk_insert(&self, entities: &[&Entity]) -> StoreResult<usize>;
}
