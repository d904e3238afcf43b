//! Generic entity base shared by every persisted type.
//!
//! # Responsibility
//! - Hold identifier, column values and lifecycle state of one instance.
//! - Provide the identity keys used by snapshots, caches and collections.
//!
//! # Invariants
//! - `Transient` instances may carry a client placeholder id; `Stored`
//!   instances always carry their durable id.
//! - `Deleted` is terminal.
//! - The instance token is minted once per constructed instance; clones share
//!   it and therefore share identity.

use crate::model::schema::{EntitySchema, FieldKind, ScalarType, SchemaError};
use crate::model::value::{LazyRef, Value};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Durable row identifier.
pub type EntityId = Uuid;

static NEXT_INSTANCE_TOKEN: AtomicU64 = AtomicU64::new(1);
static NULL_VALUE: Value = Value::Null;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Never persisted.
    Transient,
    /// Row exists in storage.
    Stored,
    /// Row removed; no further save or delete is allowed.
    Deleted,
}

/// Stable per-instance identity used to key snapshots and collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceKey {
    Stored { table: String, id: EntityId },
    Transient(u64),
}

impl Display for InstanceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stored { table, id } => write!(f, "{table}:{id}"),
            Self::Transient(token) => write!(f, "~{token}"),
        }
    }
}

/// How two entities are compared for identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyMode {
    /// Compare row identifiers (instance tokens when neither has one).
    #[default]
    Identifier,
    /// Compare the schema's declared composite key fields.
    Composite,
}

#[derive(Debug, Clone)]
pub struct Entity {
    schema: Arc<EntitySchema>,
    id: Option<EntityId>,
    values: BTreeMap<String, Value>,
    state: EntityState,
    token: u64,
}

impl Entity {
    /// Creates a transient instance with no identifier.
    pub fn new(schema: &Arc<EntitySchema>) -> Self {
        Self {
            schema: Arc::clone(schema),
            id: None,
            values: BTreeMap::new(),
            state: EntityState::Transient,
            token: mint_token(),
        }
    }

    /// Creates a transient instance with a client-supplied identifier that is
    /// kept on first save.
    pub fn with_id(schema: &Arc<EntitySchema>, id: EntityId) -> Self {
        let mut entity = Self::new(schema);
        entity.id = Some(id);
        entity
    }

    /// Builds a stored instance from values read out of storage.
    pub fn loaded(schema: Arc<EntitySchema>, id: EntityId, values: BTreeMap<String, Value>) -> Self {
        Self {
            schema,
            id: Some(id),
            values,
            state: EntityState::Stored,
            token: mint_token(),
        }
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn table(&self) -> &str {
        self.schema.table()
    }

    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn is_transient(&self) -> bool {
        self.state == EntityState::Transient
    }

    pub fn is_stored(&self) -> bool {
        self.state == EntityState::Stored
    }

    pub fn is_deleted(&self) -> bool {
        self.state == EntityState::Deleted
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Key of this instance in the snapshot store and relationship cache.
    pub fn instance_key(&self) -> InstanceKey {
        match (self.state, self.id) {
            (EntityState::Stored | EntityState::Deleted, Some(id)) => InstanceKey::Stored {
                table: self.table().to_string(),
                id,
            },
            _ => InstanceKey::Transient(self.token),
        }
    }

    /// Key of this instance as a collection member.
    pub fn member_key(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => format!("~{}", self.token),
        }
    }

    /// Current value of a column; `Null` when unset or unknown.
    pub fn get(&self, field: &str) -> &Value {
        self.values.get(field).unwrap_or(&NULL_VALUE)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).as_text()
    }

    pub fn integer(&self, field: &str) -> Option<i64> {
        self.get(field).as_integer()
    }

    pub fn reference(&self, field: &str) -> Option<&LazyRef> {
        self.get(field).as_reference()
    }

    /// Mutable access to a foreign-key reference, e.g. to resolve it.
    pub fn reference_mut(&mut self, field: &str) -> Option<&mut LazyRef> {
        match self.values.get_mut(field) {
            Some(Value::Ref(reference)) => Some(reference),
            _ => None,
        }
    }

    /// Sets a column value after checking it against the schema.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), SchemaError> {
        let value = coerce(&self.schema, field, value.into())?;
        self.values.insert(field.to_string(), value);
        Ok(())
    }

    /// Points a foreign-key field at `target`.
    pub fn set_reference(&mut self, field: &str, target: &Entity) -> Result<(), SchemaError> {
        self.set(field, LazyRef::to(target))
    }

    pub fn clear(&mut self, field: &str) -> Result<(), SchemaError> {
        self.set(field, Value::Null)
    }

    /// Column values currently held, keyed by field name.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub(crate) fn put(&mut self, field: &str, value: Value) {
        self.values.insert(field.to_string(), value);
    }

    pub(crate) fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    pub(crate) fn mark_stored(&mut self) {
        self.state = EntityState::Stored;
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.state = EntityState::Deleted;
    }
}

/// Identity comparison with composite-key awareness as a parameter.
///
/// Entities of different tables are never identical. In `Composite` mode a
/// schema without a declared composite key falls back to identifiers, and a
/// key containing `Null` never matches.
pub fn same_identity(left: &Entity, right: &Entity, mode: KeyMode) -> bool {
    if left.table() != right.table() {
        return false;
    }

    let key_fields = left.schema().composite_key();
    if mode == KeyMode::Composite && !key_fields.is_empty() {
        return key_fields.iter().all(|field| {
            let value = left.get(field);
            !value.is_null() && value == right.get(field)
        });
    }

    match (left.id(), right.id()) {
        (Some(left_id), Some(right_id)) => left_id == right_id,
        (None, None) => left.token() == right.token(),
        _ => false,
    }
}

fn mint_token() -> u64 {
    NEXT_INSTANCE_TOKEN.fetch_add(1, Ordering::Relaxed)
}

fn coerce(schema: &EntitySchema, field: &str, value: Value) -> Result<Value, SchemaError> {
    let descriptor = schema.require_field(field)?;
    let mismatch = |expected: &'static str| SchemaError::TypeMismatch {
        table: schema.table().to_string(),
        field: field.to_string(),
        expected,
    };

    if value.is_null() && descriptor.kind.is_column() {
        return Ok(value);
    }

    match (&descriptor.kind, value) {
        (FieldKind::Scalar { ty, .. }, value) => match (ty, value) {
            (ScalarType::Integer, value @ Value::Integer(_))
            | (ScalarType::Real, value @ Value::Real(_))
            | (ScalarType::Text, value @ Value::Text(_))
            | (ScalarType::Bool, value @ Value::Bool(_)) => Ok(value),
            (ScalarType::Real, Value::Integer(number)) => Ok(Value::Real(number as f64)),
            (ty, _) => Err(mismatch(ty.as_str())),
        },
        (FieldKind::ForeignKey { target, .. }, Value::Ref(reference)) => {
            if reference.table() == target.as_str() {
                Ok(Value::Ref(reference))
            } else {
                Err(mismatch("reference"))
            }
        }
        (FieldKind::ForeignKey { .. }, _) => Err(mismatch("reference")),
        (FieldKind::ForeignList { .. }, value @ Value::Text(_)) => Ok(value),
        (FieldKind::ForeignList { .. }, _) => Err(mismatch("text")),
        (FieldKind::OneToMany(_) | FieldKind::ManyToMany(_), _) => Err(SchemaError::NotAColumn {
            table: schema.table().to_string(),
            field: field.to_string(),
        }),
    }
}
