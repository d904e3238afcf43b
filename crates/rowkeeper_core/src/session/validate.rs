//! Foreign-key validation run before any write of a save.
//!
//! # Invariants
//! - A non-nullable foreign key must be set.
//! - A set foreign key, nullable or not, must point at a stored target.
//! - Validation never writes; failures are reported, not raised.

use crate::model::entity::{Entity, InstanceKey};
use crate::model::schema::FieldKind;
use crate::model::value::Value;
use serde::Serialize;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Required reference has no value.
    Unset,
    /// Reference points at a row that is not persisted.
    TargetNotStored,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::TargetNotStored => "target_not_stored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldFailure {
    pub field: String,
    pub reason: FailureReason,
}

/// Outcome of a failed validation for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub table: String,
    pub instance: InstanceKey,
    pub failures: Vec<FieldFailure>,
}

impl ValidationReport {
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|failure| failure.field.as_str())
    }

    pub fn failure(&self, field: &str) -> Option<FailureReason> {
        self.failures
            .iter()
            .find(|failure| failure.field == field)
            .map(|failure| failure.reason)
    }
}

impl Display for ValidationReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}:", self.table, self.instance)?;
        for failure in &self.failures {
            write!(f, " {}={}", failure.field, failure.reason.as_str())?;
        }
        Ok(())
    }
}

pub fn validate_foreign_keys(entity: &Entity) -> Result<(), ValidationReport> {
    let mut failures = Vec::new();
    for field in entity.schema().fields() {
        let FieldKind::ForeignKey { nullable, .. } = &field.kind else {
            continue;
        };
        let reason = match entity.get(&field.name) {
            Value::Null if !nullable => Some(FailureReason::Unset),
            Value::Ref(reference) if !reference.is_stored() => Some(FailureReason::TargetNotStored),
            _ => None,
        };
        if let Some(reason) = reason {
            failures.push(FieldFailure {
                field: field.name.clone(),
                reason,
            });
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ValidationReport {
            table: entity.table().to_string(),
            instance: entity.instance_key(),
            failures,
        })
    }
}
