//! Per-table lifecycle hooks.

use crate::model::entity::Entity;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Failure raised by a hook; aborts the surrounding unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookError {
    message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for HookError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for HookError {}

/// Callbacks around save and delete. Every method defaults to a no-op.
///
/// `after_delete` runs once the outermost unit of work has committed, so it
/// cannot fail the deletion.
pub trait LifecycleHooks {
    fn before_save(&self, _entity: &mut Entity) -> Result<(), HookError> {
        Ok(())
    }

    fn after_save(&self, _entity: &Entity) -> Result<(), HookError> {
        Ok(())
    }

    fn before_delete(&self, _entity: &Entity) -> Result<(), HookError> {
        Ok(())
    }

    fn after_delete(&self, _entity: &Entity) {}
}

/// Which hook produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeSave,
    AfterSave,
    BeforeDelete,
}

impl HookStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeSave => "before_save",
            Self::AfterSave => "after_save",
            Self::BeforeDelete => "before_delete",
        }
    }
}
