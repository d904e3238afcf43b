//! Entity model: schema descriptors, dynamic values and the entity base.
//!
//! # Responsibility
//! - Describe entity types as plain data registered once at startup.
//! - Hold per-instance column values and lifecycle state.
//!
//! # Invariants
//! - Every entity carries the `EntitySchema` it was built from.
//! - Relationship fields never live on the entity itself; they are
//!   materialized through the session's relationship cache.

pub mod entity;
pub mod schema;
pub mod value;
