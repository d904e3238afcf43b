//! SQLite implementation of `StorageBackend`.
//!
//! # Responsibility
//! - Map entity columns to SQLite rows using schema descriptors.
//! - Create entity and join tables on demand (`CREATE TABLE IF NOT EXISTS`).
//!
//! # Invariants
//! - Identifiers are stored as hyphenated UUID text in the id column.
//! - Foreign keys are stored as the target id text and read back unresolved.
//! - Booleans are stored as `0`/`1`.
//! - Table and column names come from validated schemas only.

use crate::model::entity::{Entity, EntityId};
use crate::model::schema::{EntitySchema, FieldKind, ScalarType, SchemaError, SchemaRegistry};
use crate::model::value::{LazyRef, Value};
use crate::repo::{Condition, StorageBackend, StoreError, StoreResult};
use log::{debug, info};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Join table column holding the owner identifier.
pub const JOIN_OWNER_COLUMN: &str = "owner_id";
/// Join table column holding the member identifier.
pub const JOIN_MEMBER_COLUMN: &str = "member_id";

/// SQLite-backed storage borrowing an open connection.
pub struct SqliteBackend<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteBackend<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Creates entity and join tables for every registered schema.
    ///
    /// Existing tables are left untouched.
    pub fn ensure_tables(&self, registry: &SchemaRegistry) -> StoreResult<()> {
        registry.validate()?;
        let mut created = 0_usize;
        for schema in registry.schemas() {
            self.conn.execute_batch(&create_table_sql(schema))?;
            created += 1;
            for field in schema.fields() {
                if let FieldKind::ManyToMany(relation) = &field.kind {
                    let join_table = schema.join_table(&field.name, relation);
                    self.conn.execute_batch(&format!(
                        "CREATE TABLE IF NOT EXISTS {join_table} (
                            {JOIN_OWNER_COLUMN} TEXT NOT NULL,
                            {JOIN_MEMBER_COLUMN} TEXT NOT NULL,
                            PRIMARY KEY ({JOIN_OWNER_COLUMN}, {JOIN_MEMBER_COLUMN})
                        );"
                    ))?;
                    created += 1;
                }
            }
        }
        info!("event=ensure_tables module=repo status=ok tables={created}");
        Ok(())
    }
}

impl StorageBackend for SqliteBackend<'_> {
    fn begin(&self) -> StoreResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        Ok(())
    }

    fn commit(&self) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    fn rollback(&self) -> StoreResult<()> {
        self.conn.execute_batch("ROLLBACK;")?;
        Ok(())
    }

    fn insert(&self, entity: &Entity) -> StoreResult<()> {
        let schema = entity.schema();
        let id = require_id(entity)?;
        let mut columns = vec![schema.id_column().to_string()];
        let mut bind_values = vec![SqlValue::Text(id.to_string())];
        for field in schema.columns() {
            columns.push(field.name.clone());
            bind_values.push(to_sql(entity.get(&field.name))?);
        }

        let placeholders = (1..=columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders});",
            schema.table(),
            columns.join(", ")
        );
        self.conn.execute(&sql, params_from_iter(bind_values))?;
        debug!(
            "event=row_insert module=repo status=ok table={} id={id}",
            schema.table()
        );
        Ok(())
    }

    fn update(&self, entity: &Entity, changed: &[&str]) -> StoreResult<()> {
        if changed.is_empty() {
            return Ok(());
        }

        let schema = entity.schema();
        let id = require_id(entity)?;
        let mut assignments = Vec::with_capacity(changed.len());
        let mut bind_values = Vec::with_capacity(changed.len() + 1);
        for (index, field) in changed.iter().enumerate() {
            require_column(schema, field)?;
            assignments.push(format!("{field} = ?{}", index + 1));
            bind_values.push(to_sql(entity.get(field))?);
        }
        bind_values.push(SqlValue::Text(id.to_string()));

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{};",
            schema.table(),
            assignments.join(", "),
            schema.id_column(),
            bind_values.len()
        );
        let affected = self.conn.execute(&sql, params_from_iter(bind_values))?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                table: schema.table().to_string(),
                id,
            });
        }
        Ok(())
    }

    fn delete(&self, schema: &EntitySchema, id: EntityId) -> StoreResult<bool> {
        let affected = self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1;",
                schema.table(),
                schema.id_column()
            ),
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    fn select(&self, schema: &Arc<EntitySchema>, id: EntityId) -> StoreResult<Option<Entity>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE {} = ?1;",
            select_sql(schema),
            schema.id_column()
        ))?;
        let mut rows = stmt.query(params![id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_row(schema, row)?));
        }
        Ok(None)
    }

    fn select_where(
        &self,
        schema: &Arc<EntitySchema>,
        conditions: &[Condition],
    ) -> StoreResult<Vec<Entity>> {
        let mut sql = format!("{} WHERE 1 = 1", select_sql(schema));
        let mut bind_values: Vec<SqlValue> = Vec::new();
        for condition in conditions {
            if condition.field != schema.id_column() {
                require_column(schema, &condition.field)?;
            }
            if condition.value.is_null() {
                sql.push_str(&format!(" AND {} IS NULL", condition.field));
            } else {
                bind_values.push(to_sql(&condition.value)?);
                sql.push_str(&format!(" AND {} = ?{}", condition.field, bind_values.len()));
            }
        }
        sql.push_str(&format!(" ORDER BY {} ASC;", schema.id_column()));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(parse_row(schema, row)?);
        }
        Ok(entities)
    }

    fn select_associated(
        &self,
        join_table: &str,
        owner_id: EntityId,
    ) -> StoreResult<Vec<EntityId>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOIN_MEMBER_COLUMN} FROM {join_table}
             WHERE {JOIN_OWNER_COLUMN} = ?1
             ORDER BY {JOIN_MEMBER_COLUMN} ASC;"
        ))?;
        let mut rows = stmt.query(params![owner_id.to_string()])?;
        let mut members = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            members.push(parse_id(&raw)?);
        }
        Ok(members)
    }

    fn insert_association(
        &self,
        join_table: &str,
        owner_id: EntityId,
        member_id: EntityId,
    ) -> StoreResult<()> {
        self.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {join_table} ({JOIN_OWNER_COLUMN}, {JOIN_MEMBER_COLUMN})
                 VALUES (?1, ?2);"
            ),
            params![owner_id.to_string(), member_id.to_string()],
        )?;
        Ok(())
    }

    fn delete_association(
        &self,
        join_table: &str,
        owner_id: EntityId,
        member_id: EntityId,
    ) -> StoreResult<bool> {
        let affected = self.conn.execute(
            &format!(
                "DELETE FROM {join_table}
                 WHERE {JOIN_OWNER_COLUMN} = ?1 AND {JOIN_MEMBER_COLUMN} = ?2;"
            ),
            params![owner_id.to_string(), member_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    fn bulk_insert(&self, entities: &[&Entity]) -> StoreResult<usize> {
        for entity in entities {
            self.insert(entity)?;
        }
        Ok(entities.len())
    }
}

fn create_table_sql(schema: &EntitySchema) -> String {
    let mut columns = vec![format!("{} TEXT PRIMARY KEY NOT NULL", schema.id_column())];
    for field in schema.columns() {
        let definition = match &field.kind {
            FieldKind::Scalar { ty, nullable } => {
                let sql_type = match ty {
                    ScalarType::Integer | ScalarType::Bool => "INTEGER",
                    ScalarType::Real => "REAL",
                    ScalarType::Text => "TEXT",
                };
                if *nullable {
                    sql_type.to_string()
                } else {
                    format!("{sql_type} NOT NULL")
                }
            }
            _ => "TEXT".to_string(),
        };
        columns.push(format!("{} {definition}", field.name));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
        schema.table(),
        columns.join(",\n    ")
    )
}

fn select_sql(schema: &EntitySchema) -> String {
    let mut columns = vec![schema.id_column().to_string()];
    columns.extend(schema.columns().map(|field| field.name.clone()));
    format!("SELECT {} FROM {}", columns.join(", "), schema.table())
}

fn require_column(schema: &EntitySchema, field: &str) -> StoreResult<()> {
    let descriptor = schema.require_field(field)?;
    if descriptor.kind.is_column() {
        Ok(())
    } else {
        Err(SchemaError::NotAColumn {
            table: schema.table().to_string(),
            field: field.to_string(),
        }
        .into())
    }
}

fn require_id(entity: &Entity) -> StoreResult<EntityId> {
    entity.id().ok_or_else(|| {
        StoreError::InvalidData(format!("{} row has no identifier", entity.table()))
    })
}

fn to_sql(value: &Value) -> StoreResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Integer(number) => SqlValue::Integer(*number),
        Value::Real(number) => SqlValue::Real(*number),
        Value::Text(text) => SqlValue::Text(text.clone()),
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Ref(reference) => match reference.id() {
            Some(id) => SqlValue::Text(id.to_string()),
            None => {
                return Err(StoreError::InvalidData(format!(
                    "reference to unsaved `{}` row",
                    reference.table()
                )))
            }
        },
    })
}

fn parse_row(schema: &Arc<EntitySchema>, row: &Row<'_>) -> StoreResult<Entity> {
    let raw_id: String = row.get(schema.id_column())?;
    let id = parse_id(&raw_id)?;

    let mut values = BTreeMap::new();
    for field in schema.columns() {
        let raw: SqlValue = row.get(field.name.as_str())?;
        let value = from_sql(schema, &field.name, &field.kind, raw)?;
        values.insert(field.name.clone(), value);
    }
    Ok(Entity::loaded(Arc::clone(schema), id, values))
}

fn from_sql(schema: &EntitySchema, field: &str, kind: &FieldKind, raw: SqlValue) -> StoreResult<Value> {
    let invalid = |found: &SqlValue| {
        StoreError::InvalidData(format!(
            "{}.{field} holds unexpected {:?}",
            schema.table(),
            found.data_type()
        ))
    };

    if raw == SqlValue::Null {
        return Ok(Value::Null);
    }

    match (kind, raw) {
        (FieldKind::Scalar { ty, .. }, raw) => match (ty, raw) {
            (ScalarType::Integer, SqlValue::Integer(number)) => Ok(Value::Integer(number)),
            (ScalarType::Real, SqlValue::Real(number)) => Ok(Value::Real(number)),
            (ScalarType::Real, SqlValue::Integer(number)) => Ok(Value::Real(number as f64)),
            (ScalarType::Text, SqlValue::Text(text)) => Ok(Value::Text(text)),
            (ScalarType::Bool, SqlValue::Integer(0)) => Ok(Value::Bool(false)),
            (ScalarType::Bool, SqlValue::Integer(1)) => Ok(Value::Bool(true)),
            (_, other) => Err(invalid(&other)),
        },
        (FieldKind::ForeignKey { target, .. }, SqlValue::Text(text)) => Ok(Value::Ref(
            LazyRef::unresolved(target.clone(), parse_id(&text)?),
        )),
        (FieldKind::ForeignList { .. }, SqlValue::Text(text)) => Ok(Value::Text(text)),
        (_, other) => Err(invalid(&other)),
    }
}

fn parse_id(raw: &str) -> StoreResult<EntityId> {
    Uuid::parse_str(raw).map_err(|_| StoreError::InvalidData(format!("invalid identifier `{raw}`")))
}
