//! Field values and lazily resolved foreign-key references.
//!
//! # Invariants
//! - `LazyRef` equality is identity-key equality: a resolved target and an
//!   unresolved identifier compare equal when they name the same row.
//! - Values serialize to plain JSON scalars; references serialize as their
//!   identity key.

use crate::model::entity::{Entity, EntityId};
use crate::session::PersistResult;
use serde::{Serialize, Serializer};

/// Dynamic value of one entity column.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Ref(LazyRef),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Real(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&LazyRef> {
        match self {
            Self::Ref(reference) => Some(reference),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Bool(_) => "bool",
            Self::Ref(_) => "reference",
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<LazyRef> for Value {
    fn from(value: LazyRef) -> Self {
        Self::Ref(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Integer(value) => serializer.serialize_i64(*value),
            Self::Real(value) => serializer.serialize_f64(*value),
            Self::Text(value) => serializer.serialize_str(value),
            Self::Bool(value) => serializer.serialize_bool(*value),
            Self::Ref(reference) => serializer.serialize_str(&reference.key()),
        }
    }
}

/// Capability used to load a referenced row on first access.
pub trait ReferenceResolver {
    fn resolve_reference(&mut self, table: &str, id: EntityId) -> PersistResult<Option<Entity>>;
}

/// Foreign-key reference holding either the target itself or only its id.
#[derive(Debug, Clone)]
pub enum LazyRef {
    Unresolved { table: String, id: EntityId },
    Resolved(Box<Entity>),
}

impl LazyRef {
    /// Reference to a row known only by identifier.
    pub fn unresolved(table: impl Into<String>, id: EntityId) -> Self {
        Self::Unresolved {
            table: table.into(),
            id,
        }
    }

    /// Reference capturing `target` as it is at call time.
    pub fn to(target: &Entity) -> Self {
        Self::Resolved(Box::new(target.clone()))
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Unresolved { table, .. } => table,
            Self::Resolved(target) => target.table(),
        }
    }

    pub fn id(&self) -> Option<EntityId> {
        match self {
            Self::Unresolved { id, .. } => Some(*id),
            Self::Resolved(target) => target.id(),
        }
    }

    /// Identity key used for equality and audit rendering.
    pub fn key(&self) -> String {
        match self {
            Self::Unresolved { id, .. } => id.to_string(),
            Self::Resolved(target) => target.member_key(),
        }
    }

    /// Whether the target is known to be persisted.
    ///
    /// Unresolved references only ever come from storage, so they count as
    /// stored.
    pub fn is_stored(&self) -> bool {
        match self {
            Self::Unresolved { .. } => true,
            Self::Resolved(target) => target.is_stored(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    pub fn resolved(&self) -> Option<&Entity> {
        match self {
            Self::Resolved(target) => Some(target),
            Self::Unresolved { .. } => None,
        }
    }

    pub(crate) fn resolved_mut(&mut self) -> Option<&mut Entity> {
        match self {
            Self::Resolved(target) => Some(target),
            Self::Unresolved { .. } => None,
        }
    }

    /// Loads the target through `resolver` on first access.
    ///
    /// Returns `None` when the referenced row no longer exists; the reference
    /// then stays unresolved.
    pub fn resolve(
        &mut self,
        resolver: &mut dyn ReferenceResolver,
    ) -> PersistResult<Option<&Entity>> {
        if let Self::Unresolved { table, id } = self {
            let (table, id) = (table.clone(), *id);
            match resolver.resolve_reference(&table, id)? {
                Some(target) => *self = Self::Resolved(Box::new(target)),
                None => return Ok(None),
            }
        }
        Ok(self.resolved())
    }
}

impl PartialEq for LazyRef {
    fn eq(&self, other: &Self) -> bool {
        self.table() == other.table() && self.key() == other.key()
    }
}
