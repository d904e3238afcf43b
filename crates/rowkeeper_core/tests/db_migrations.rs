mod common;

use rowkeeper_core::db::migrations::latest_version;
use rowkeeper_core::db::{open_db, open_db_in_memory, schema_version, DbError};
use rowkeeper_core::{SqliteBackend, StorageBackend};
use rusqlite::Connection;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn).unwrap(), latest_version());
    assert_table_exists(&conn, "audit_log");
    assert_index_exists(&conn, "idx_audit_log_entity");
    assert_index_exists(&conn, "idx_audit_log_kind");
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rowkeeper.db");

    let conn_first = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_first).unwrap(), latest_version());
    drop(conn_first);

    let conn_second = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_second).unwrap(), latest_version());
    assert_table_exists(&conn_second, "audit_log");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn failing_migration_reports_its_version_and_keeps_the_previous_stamp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE audit_log (seq INTEGER PRIMARY KEY, entity_table TEXT);
         PRAGMA user_version = 1;",
    )
    .unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    assert_eq!(err.code(), "migration_failed");
    assert!(matches!(err, DbError::Migration { version: 2, .. }));

    let conn = Connection::open(&path).unwrap();
    assert_eq!(schema_version(&conn).unwrap(), 1);
}

#[test]
fn ensure_tables_creates_entity_and_join_tables_once() {
    let conn = open_db_in_memory().unwrap();
    let registry = common::library_registry();
    let backend = SqliteBackend::new(&conn);

    backend.ensure_tables(&registry).unwrap();
    backend.ensure_tables(&registry).unwrap();

    for table in ["publishers", "authors", "books", "chapters", "tags", "shelves"] {
        assert_table_exists(&conn, table);
    }
    assert_table_exists(&conn, "books_tags");
    assert_eq!(schema_version(&conn).unwrap(), latest_version());
}

#[test]
fn entity_rows_survive_reopening_a_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("library.db");
    let registry = common::library_registry();
    let authors = registry.require("authors").unwrap();

    let mut author = common::named(&authors, "name", "Lem");
    {
        let conn = open_db(&path).unwrap();
        SqliteBackend::new(&conn).ensure_tables(&registry).unwrap();
        let store = common::RecordingBackend::new(SqliteBackend::new(&conn));
        let audit = rowkeeper_core::MemoryAuditLog::new();
        let errors = common::RecordingErrors::default();
        let mut session =
            rowkeeper_core::Session::try_new(&store, &audit, &errors, &registry).unwrap();
        session.save(&mut author).unwrap();
    }

    let conn = open_db(&path).unwrap();
    let row = SqliteBackend::new(&conn)
        .select(&authors, author.id().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(row.text("name"), Some("Lem"));
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    assert_schema_object_exists(conn, "table", table_name);
}

fn assert_index_exists(conn: &Connection, index_name: &str) {
    assert_schema_object_exists(conn, "index", index_name);
}

fn assert_schema_object_exists(conn: &Connection, kind: &str, name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = ?1 AND name = ?2
            );",
            [kind, name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "{kind} {name} does not exist");
}
