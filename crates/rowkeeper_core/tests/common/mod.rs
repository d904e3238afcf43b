#![allow(dead_code)]

use rowkeeper_core::db::open_db_in_memory;
use rowkeeper_core::{
    Condition, Entity, EntityId, EntitySchema, ErrorSink, ManyToMany, MemoryAuditLog, OneToMany,
    PersistError, ScalarType, SchemaRegistry, Session, SqliteBackend, StorageBackend, StoreError,
    StoreResult,
};
use rusqlite::Connection;
use std::cell::RefCell;
use std::sync::Arc;

/// Connection, registry and sinks shared by one test.
pub struct Harness {
    pub conn: Connection,
    pub registry: SchemaRegistry,
    pub audit: MemoryAuditLog,
    pub errors: RecordingErrors,
}

impl Harness {
    pub fn new() -> Self {
        let conn = open_db_in_memory().unwrap();
        let registry = library_registry();
        SqliteBackend::new(&conn).ensure_tables(&registry).unwrap();
        Self {
            conn,
            registry,
            audit: MemoryAuditLog::new(),
            errors: RecordingErrors::default(),
        }
    }

    pub fn backend(&self) -> RecordingBackend<'_> {
        RecordingBackend::new(SqliteBackend::new(&self.conn))
    }

    pub fn session<'a>(&'a self, store: &'a RecordingBackend<'a>) -> Session<'a> {
        Session::try_new(store, &self.audit, &self.errors, &self.registry).unwrap()
    }

    pub fn schema(&self, table: &str) -> Arc<EntitySchema> {
        self.registry.require(table).unwrap()
    }

    pub fn count_rows(&self, table: &str) -> i64 {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
                row.get(0)
            })
            .unwrap()
    }

    /// Associated member ids read straight from a join table.
    pub fn join_members(&self, join_table: &str, owner_id: EntityId) -> Vec<EntityId> {
        let mut members = SqliteBackend::new(&self.conn)
            .select_associated(join_table, owner_id)
            .unwrap();
        members.sort();
        members
    }

    pub fn row(&self, table: &str, id: EntityId) -> Option<Entity> {
        SqliteBackend::new(&self.conn)
            .select(&self.schema(table), id)
            .unwrap()
    }
}

/// publishers <- authors -> books (inverse) -> chapters (owned), books <-> tags,
/// books -> shelves (identifier list).
pub fn library_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            EntitySchema::builder("publishers")
                .scalar("name", ScalarType::Text)
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            EntitySchema::builder("authors")
                .scalar("name", ScalarType::Text)
                .nullable_scalar("email", ScalarType::Text)
                .foreign_key("publisher", "publishers", true)
                .one_to_many("books", OneToMany::new("books", "author").inverse())
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            EntitySchema::builder("books")
                .scalar("title", ScalarType::Text)
                .nullable_scalar("pages", ScalarType::Integer)
                .foreign_key("author", "authors", true)
                .foreign_list("shelves", "shelves")
                .many_to_many("tags", ManyToMany::new("tags"))
                .one_to_many("chapters", OneToMany::new("chapters", "book"))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            EntitySchema::builder("chapters")
                .scalar("title", ScalarType::Text)
                .foreign_key("book", "books", false)
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            EntitySchema::builder("tags")
                .scalar("label", ScalarType::Text)
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            EntitySchema::builder("shelves")
                .scalar("name", ScalarType::Text)
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
}

pub fn named(schema: &Arc<EntitySchema>, field: &str, value: &str) -> Entity {
    let mut entity = Entity::new(schema);
    entity.set(field, value).unwrap();
    entity
}

/// SQLite backend that logs every write and can fail writes to one table.
pub struct RecordingBackend<'conn> {
    inner: SqliteBackend<'conn>,
    writes: RefCell<Vec<String>>,
    failing_table: RefCell<Option<String>>,
}

impl<'conn> RecordingBackend<'conn> {
    pub fn new(inner: SqliteBackend<'conn>) -> Self {
        Self {
            inner,
            writes: RefCell::new(Vec::new()),
            failing_table: RefCell::new(None),
        }
    }

    /// Write log entries such as `insert authors` or `update books title`.
    pub fn writes(&self) -> Vec<String> {
        self.writes.borrow().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.borrow().len()
    }

    pub fn clear_writes(&self) {
        self.writes.borrow_mut().clear();
    }

    pub fn fail_writes_to(&self, table: &str) {
        *self.failing_table.borrow_mut() = Some(table.to_string());
    }

    pub fn stop_failing(&self) {
        *self.failing_table.borrow_mut() = None;
    }

    fn write(&self, table: &str, entry: String) -> StoreResult<()> {
        if self.failing_table.borrow().as_deref() == Some(table) {
            return Err(StoreError::InvalidData(format!("injected failure on {table}")));
        }
        self.writes.borrow_mut().push(entry);
        Ok(())
    }
}

impl StorageBackend for RecordingBackend<'_> {
    fn begin(&self) -> StoreResult<()> {
        self.inner.begin()
    }

    fn commit(&self) -> StoreResult<()> {
        self.inner.commit()
    }

    fn rollback(&self) -> StoreResult<()> {
        self.inner.rollback()
    }

    fn insert(&self, entity: &Entity) -> StoreResult<()> {
        self.write(entity.table(), format!("insert {}", entity.table()))?;
        self.inner.insert(entity)
    }

    fn update(&self, entity: &Entity, changed: &[&str]) -> StoreResult<()> {
        self.write(
            entity.table(),
            format!("update {} {}", entity.table(), changed.join(",")),
        )?;
        self.inner.update(entity, changed)
    }

    fn delete(&self, schema: &EntitySchema, id: EntityId) -> StoreResult<bool> {
        self.write(schema.table(), format!("delete {}", schema.table()))?;
        self.inner.delete(schema, id)
    }

    fn select(&self, schema: &Arc<EntitySchema>, id: EntityId) -> StoreResult<Option<Entity>> {
        self.inner.select(schema, id)
    }

    fn select_where(
        &self,
        schema: &Arc<EntitySchema>,
        conditions: &[Condition],
    ) -> StoreResult<Vec<Entity>> {
        self.inner.select_where(schema, conditions)
    }

    fn select_associated(&self, join_table: &str, owner_id: EntityId) -> StoreResult<Vec<EntityId>> {
        self.inner.select_associated(join_table, owner_id)
    }

    fn insert_association(
        &self,
        join_table: &str,
        owner_id: EntityId,
        member_id: EntityId,
    ) -> StoreResult<()> {
        self.write(join_table, format!("link {join_table}"))?;
        self.inner.insert_association(join_table, owner_id, member_id)
    }

    fn delete_association(
        &self,
        join_table: &str,
        owner_id: EntityId,
        member_id: EntityId,
    ) -> StoreResult<bool> {
        self.write(join_table, format!("unlink {join_table}"))?;
        self.inner.delete_association(join_table, owner_id, member_id)
    }

    fn bulk_insert(&self, entities: &[&Entity]) -> StoreResult<usize> {
        for entity in entities {
            self.write(entity.table(), format!("insert {}", entity.table()))?;
        }
        self.inner.bulk_insert(entities)
    }
}

/// Error sink keeping `(operation, error_code)` pairs.
#[derive(Default)]
pub struct RecordingErrors {
    recorded: RefCell<Vec<(String, String)>>,
}

impl RecordingErrors {
    pub fn recorded(&self) -> Vec<(String, String)> {
        self.recorded.borrow().clone()
    }
}

impl ErrorSink for RecordingErrors {
    fn record(&self, operation: &str, error: &PersistError) {
        self.recorded
            .borrow_mut()
            .push((operation.to_string(), error.code().to_string()));
    }
}
