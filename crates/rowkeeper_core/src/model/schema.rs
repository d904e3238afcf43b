//! Per-type schema descriptors and the registry that owns them.
//!
//! # Responsibility
//! - Describe, per entity table, which fields are columns, foreign keys,
//!   foreign-reference lists, one-to-many or many-to-many relations.
//! - Validate descriptors once at registration time.
//!
//! # Invariants
//! - Table and column names match `^[A-Za-z_][A-Za-z0-9_]*$`, so they can be
//!   interpolated into SQL without quoting.
//! - Field names are unique within one schema and never equal the id column.
//! - Every relation target named by a registered schema is itself registered
//!   once `SchemaRegistry::validate` succeeds.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

const DEFAULT_ID_COLUMN: &str = "id";

static IDENTIFIER_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

/// Configuration errors in schema descriptors or their usage.
///
/// These are programming errors: they surface immediately and are never
/// retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    InvalidIdentifier(String),
    DuplicateField {
        table: String,
        field: String,
    },
    DuplicateTable(String),
    UnknownTable(String),
    UnknownField {
        table: String,
        field: String,
    },
    /// Field exists but is not a column (for example a collection).
    NotAColumn {
        table: String,
        field: String,
    },
    /// Field exists but is not a relationship.
    NotARelation {
        table: String,
        field: String,
    },
    TypeMismatch {
        table: String,
        field: String,
        expected: &'static str,
    },
    /// A relationship declaration is missing metadata it needs.
    IncompleteRelation {
        table: String,
        field: String,
        message: String,
    },
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIdentifier(name) => write!(f, "invalid SQL identifier `{name}`"),
            Self::DuplicateField { table, field } => {
                write!(f, "field `{field}` declared twice on `{table}`")
            }
            Self::DuplicateTable(table) => write!(f, "schema `{table}` already registered"),
            Self::UnknownTable(table) => write!(f, "no schema registered for `{table}`"),
            Self::UnknownField { table, field } => {
                write!(f, "`{table}` has no field `{field}`")
            }
            Self::NotAColumn { table, field } => {
                write!(f, "`{table}.{field}` is a relationship, not a column")
            }
            Self::NotARelation { table, field } => {
                write!(f, "`{table}.{field}` is not a relationship")
            }
            Self::TypeMismatch {
                table,
                field,
                expected,
            } => write!(f, "`{table}.{field}` expects a {expected} value"),
            Self::IncompleteRelation {
                table,
                field,
                message,
            } => write!(f, "relationship `{table}.{field}` is incomplete: {message}"),
        }
    }
}

impl Error for SchemaError {}

/// Storage type of a scalar column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Integer,
    Real,
    Text,
    Bool,
}

impl ScalarType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
            Self::Bool => "bool",
        }
    }
}

/// One-to-many binding: child rows carry a back-reference to the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneToMany {
    /// Child table.
    pub target: String,
    /// Child field that points back at the owner.
    pub back_reference: String,
    /// Owner column stored in the back-reference instead of the owner id.
    pub referenced_column: Option<String>,
    /// Inverse bindings detach children on owner delete; owning bindings
    /// delete them.
    pub inverse: bool,
}

impl OneToMany {
    pub fn new(target: impl Into<String>, back_reference: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            back_reference: back_reference.into(),
            referenced_column: None,
            inverse: false,
        }
    }

    pub fn inverse(mut self) -> Self {
        self.inverse = true;
        self
    }

    pub fn referencing(mut self, column: impl Into<String>) -> Self {
        self.referenced_column = Some(column.into());
        self
    }
}

/// Many-to-many binding through a join table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManyToMany {
    pub target: String,
    /// Alternate join table name; defaults to `<owner>_<field>`.
    pub join_table: Option<String>,
}

impl ManyToMany {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            join_table: None,
        }
    }

    pub fn via(mut self, join_table: impl Into<String>) -> Self {
        self.join_table = Some(join_table.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar { ty: ScalarType, nullable: bool },
    ForeignKey { target: String, nullable: bool },
    /// Denormalized identifier list stored in a column on the owner.
    ForeignList { target: String },
    OneToMany(OneToMany),
    ManyToMany(ManyToMany),
}

impl FieldKind {
    /// Whether the field is stored as a column of the owner row.
    pub fn is_column(&self) -> bool {
        matches!(
            self,
            Self::Scalar { .. } | Self::ForeignKey { .. } | Self::ForeignList { .. }
        )
    }

    /// Whether the field is materialized through the relationship cache.
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            Self::ForeignList { .. } | Self::OneToMany(_) | Self::ManyToMany(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
}

/// Immutable descriptor of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    table: String,
    id_column: String,
    fields: Vec<FieldDescriptor>,
    composite_key: Vec<String>,
}

impl EntitySchema {
    pub fn builder(table: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder {
            table: table.into(),
            id_column: DEFAULT_ID_COLUMN.to_string(),
            fields: Vec::new(),
            composite_key: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Fields stored on the owner row, in declaration order.
    pub fn columns(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|field| field.kind.is_column())
    }

    /// Relationship fields, in declaration order.
    pub fn collections(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|field| field.kind.is_collection())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn require_field(&self, name: &str) -> Result<&FieldDescriptor, SchemaError> {
        self.field(name).ok_or_else(|| SchemaError::UnknownField {
            table: self.table.clone(),
            field: name.to_string(),
        })
    }

    /// Fields that make up the natural (composite) key, if declared.
    pub fn composite_key(&self) -> &[String] {
        &self.composite_key
    }

    /// Join table used by a many-to-many field.
    pub fn join_table(&self, field: &str, relation: &ManyToMany) -> String {
        relation
            .join_table
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.table, field))
    }
}

/// Builder for `EntitySchema`; `build` validates the declaration.
#[derive(Debug, Clone)]
pub struct EntitySchemaBuilder {
    table: String,
    id_column: String,
    fields: Vec<FieldDescriptor>,
    composite_key: Vec<String>,
}

impl EntitySchemaBuilder {
    pub fn id_column(mut self, name: impl Into<String>) -> Self {
        self.id_column = name.into();
        self
    }

    pub fn scalar(self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.field(name, FieldKind::Scalar { ty, nullable: false })
    }

    pub fn nullable_scalar(self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.field(name, FieldKind::Scalar { ty, nullable: true })
    }

    pub fn foreign_key(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        nullable: bool,
    ) -> Self {
        self.field(
            name,
            FieldKind::ForeignKey {
                target: target.into(),
                nullable,
            },
        )
    }

    pub fn foreign_list(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.field(
            name,
            FieldKind::ForeignList {
                target: target.into(),
            },
        )
    }

    pub fn one_to_many(self, name: impl Into<String>, relation: OneToMany) -> Self {
        self.field(name, FieldKind::OneToMany(relation))
    }

    pub fn many_to_many(self, name: impl Into<String>, relation: ManyToMany) -> Self {
        self.field(name, FieldKind::ManyToMany(relation))
    }

    /// Declares the natural key used by composite identity comparison.
    pub fn composite_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.composite_key = fields.into_iter().map(Into::into).collect();
        self
    }

    fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn build(self) -> Result<EntitySchema, SchemaError> {
        ensure_identifier(&self.table)?;
        ensure_identifier(&self.id_column)?;

        let mut seen = Vec::<&str>::with_capacity(self.fields.len());
        for field in &self.fields {
            ensure_identifier(&field.name)?;
            if field.name == self.id_column || seen.contains(&field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    table: self.table.clone(),
                    field: field.name.clone(),
                });
            }
            seen.push(field.name.as_str());

            match &field.kind {
                FieldKind::Scalar { .. } => {}
                FieldKind::ForeignKey { target, .. } | FieldKind::ForeignList { target } => {
                    ensure_identifier(target)?;
                }
                FieldKind::OneToMany(relation) => {
                    ensure_identifier(&relation.target)?;
                    if relation.back_reference.trim().is_empty() {
                        return Err(incomplete(
                            &self.table,
                            &field.name,
                            "missing back-reference field",
                        ));
                    }
                    ensure_identifier(&relation.back_reference)?;
                    if let Some(column) = &relation.referenced_column {
                        ensure_identifier(column)?;
                    }
                }
                FieldKind::ManyToMany(relation) => {
                    ensure_identifier(&relation.target)?;
                    if let Some(join_table) = &relation.join_table {
                        ensure_identifier(join_table)?;
                    }
                }
            }
        }

        for key_field in &self.composite_key {
            let declared = self
                .fields
                .iter()
                .any(|field| &field.name == key_field && field.kind.is_column());
            if !declared {
                return Err(SchemaError::UnknownField {
                    table: self.table.clone(),
                    field: key_field.clone(),
                });
            }
        }

        Ok(EntitySchema {
            table: self.table,
            id_column: self.id_column,
            fields: self.fields,
            composite_key: self.composite_key,
        })
    }
}

/// Startup registry of every entity schema known to a session.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Arc<EntitySchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one schema and returns the shared descriptor.
    pub fn register(&mut self, schema: EntitySchema) -> Result<Arc<EntitySchema>, SchemaError> {
        if self.schemas.contains_key(schema.table()) {
            return Err(SchemaError::DuplicateTable(schema.table().to_string()));
        }
        let schema = Arc::new(schema);
        self.schemas
            .insert(schema.table().to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn get(&self, table: &str) -> Option<Arc<EntitySchema>> {
        self.schemas.get(table).cloned()
    }

    pub fn require(&self, table: &str) -> Result<Arc<EntitySchema>, SchemaError> {
        self.get(table)
            .ok_or_else(|| SchemaError::UnknownTable(table.to_string()))
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.schemas.values()
    }

    /// Checks cross-schema references: relation targets exist, one-to-many
    /// back-references exist on the child (nullable for inverse bindings) and
    /// alternate referencing columns exist on the owner.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for schema in self.schemas.values() {
            for field in schema.fields() {
                match &field.kind {
                    FieldKind::Scalar { .. } => {}
                    FieldKind::ForeignKey { target, .. }
                    | FieldKind::ForeignList { target }
                    | FieldKind::ManyToMany(ManyToMany { target, .. }) => {
                        self.require(target)?;
                    }
                    FieldKind::OneToMany(relation) => {
                        let child = self.require(&relation.target)?;
                        let back_reference = child.field(&relation.back_reference);
                        if !back_reference.is_some_and(|descriptor| descriptor.kind.is_column()) {
                            return Err(incomplete(
                                schema.table(),
                                &field.name,
                                &format!(
                                    "`{}` has no column `{}`",
                                    relation.target, relation.back_reference
                                ),
                            ));
                        }
                        let detachable = back_reference.is_some_and(|descriptor| {
                            matches!(
                                descriptor.kind,
                                FieldKind::Scalar { nullable: true, .. }
                                    | FieldKind::ForeignKey { nullable: true, .. }
                                    | FieldKind::ForeignList { .. }
                            )
                        });
                        if relation.inverse && !detachable {
                            return Err(incomplete(
                                schema.table(),
                                &field.name,
                                &format!(
                                    "inverse binding needs nullable `{}.{}`",
                                    relation.target, relation.back_reference
                                ),
                            ));
                        }
                        if let Some(column) = &relation.referenced_column {
                            if !schema.field(column).is_some_and(|f| f.kind.is_column()) {
                                return Err(incomplete(
                                    schema.table(),
                                    &field.name,
                                    &format!("owner has no referenced column `{column}`"),
                                ));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Returns whether `name` can be used as a table or column name.
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name))
}

fn ensure_identifier(name: &str) -> Result<(), SchemaError> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(name.to_string()))
    }
}

fn incomplete(table: &str, field: &str, message: &str) -> SchemaError {
    SchemaError::IncompleteRelation {
        table: table.to_string(),
        field: field.to_string(),
        message: message.to_string(),
    }
}
