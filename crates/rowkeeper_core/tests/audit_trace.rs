mod common;

use common::{named, Harness};
use rowkeeper_core::db::open_db_in_memory;
use rowkeeper_core::{
    ChangeKind, RefreshOutcome, SaveOutcome, Session, SessionConfig, SqliteAuditLog,
    SqliteBackend, StoreError, Value,
};
use std::rc::Rc;

#[test]
fn update_audit_carries_one_event_per_changed_property() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let authors = harness.schema("authors");
    let publishers = harness.schema("publishers");

    let mut publisher = named(&publishers, "name", "Gollancz");
    session.save(&mut publisher).unwrap();
    let mut author = named(&authors, "name", "Reynolds");
    session.save(&mut author).unwrap();
    harness.audit.clear();
    store.clear_writes();

    author.set("name", "Alastair Reynolds").unwrap();
    author.set("email", "ar@example.com").unwrap();
    author.set_reference("publisher", &publisher).unwrap();
    assert_eq!(session.save(&mut author).unwrap(), SaveOutcome::Updated);

    assert_eq!(store.writes(), vec!["update authors name,email,publisher"]);
    let records = harness.audit.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.kind, ChangeKind::Updated);
    assert_eq!(record.events.len(), 3);

    let name = record.event("name").unwrap();
    assert_eq!(name.old, Value::from("Reynolds"));
    assert_eq!(name.new, Value::from("Alastair Reynolds"));
    let email = record.event("email").unwrap();
    assert!(email.old.is_null());
    let publisher_event = record.event("publisher").unwrap();
    assert!(publisher_event.old.is_null());
    assert_eq!(
        publisher_event.new.as_reference().and_then(|target| target.id()),
        publisher.id()
    );
}

#[test]
fn update_audit_combines_scalar_and_membership_changes() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let books = harness.schema("books");
    let tags = harness.schema("tags");

    let mut book = named(&books, "title", "Neuromancer");
    session.save(&mut book).unwrap();
    harness.audit.clear();

    book.set("title", "Neuromancer (reissue)").unwrap();
    book.set("pages", 271_i64).unwrap();
    session
        .add_member(&book, "tags", named(&tags, "label", "cyberpunk"))
        .unwrap();
    assert_eq!(session.save(&mut book).unwrap(), SaveOutcome::Updated);

    let records = harness.audit.records();
    let record = records
        .iter()
        .find(|record| record.table == "books")
        .unwrap();
    assert_eq!(record.kind, ChangeKind::Updated);
    let properties: Vec<&str> = record
        .events
        .iter()
        .map(|event| event.property.as_str())
        .collect();
    assert_eq!(properties, vec!["title", "pages", "tags"]);

    let tag_id = session.collection(&book, "tags").unwrap().borrow().members()[0]
        .id()
        .unwrap();
    let tags_event = record.event("tags").unwrap();
    assert!(tags_event.old.is_null());
    assert_eq!(tags_event.new, Value::Text(tag_id.to_string()));
}

#[test]
fn trace_reports_changes_without_writing() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let books = harness.schema("books");

    let mut book = named(&books, "title", "Hyperion");
    session.save(&mut book).unwrap();
    store.clear_writes();

    assert!(session.trace(&book, true).unwrap().is_empty());
    book.set("pages", 482_i64).unwrap();
    let events = session.trace(&book, false).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].property, "pages");
    assert!(events[0].old.is_null());
    assert_eq!(events[0].new, Value::Integer(482));
    assert_eq!(store.write_count(), 0);

    let transient = named(&books, "title", "Endymion");
    assert!(session.trace(&transient, true).unwrap().is_empty());
}

#[test]
fn trace_includes_collection_changes_only_when_asked() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let books = harness.schema("books");
    let tags = harness.schema("tags");

    let mut book = named(&books, "title", "Accelerando");
    session.save(&mut book).unwrap();
    session
        .add_member(&book, "tags", named(&tags, "label", "singularity"))
        .unwrap();

    assert!(session.trace(&book, false).unwrap().is_empty());
    let events = session.trace(&book, true).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].property, "tags");
    assert!(events[0].old.is_null());
    assert!(session.is_dirty(&book).unwrap());
}

#[test]
fn foreign_list_membership_changes_are_dirty_before_save() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let books = harness.schema("books");
    let shelves = harness.schema("shelves");

    let mut shelf = named(&shelves, "name", "classics");
    session.save(&mut shelf).unwrap();
    let shelf_id = shelf.id().unwrap();
    let mut book = named(&books, "title", "The Dispossessed");
    session.save(&mut book).unwrap();
    assert!(!session.is_dirty(&book).unwrap());

    session.add_member(&book, "shelves", shelf.clone()).unwrap();
    assert!(session.is_dirty(&book).unwrap());
    assert!(session.trace(&book, false).unwrap().is_empty());
    let events = session.trace(&book, true).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].property, "shelves");
    assert!(events[0].old.is_null());
    assert_eq!(events[0].new, Value::Text(shelf_id.to_string()));

    assert_eq!(session.save(&mut book).unwrap(), SaveOutcome::Updated);
    assert!(!session.is_dirty(&book).unwrap());

    session.remove_member(&book, "shelves", &shelf).unwrap();
    assert!(session.is_dirty(&book).unwrap());
    let events = session.trace(&book, true).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].old, Value::Text(shelf_id.to_string()));
    assert!(events[0].new.is_null());

    session.save(&mut book).unwrap();
    assert!(!session.is_dirty(&book).unwrap());
    let row = harness.row("books", book.id().unwrap()).unwrap();
    assert!(row.get("shelves").is_null());
}

#[test]
fn reset_restores_snapshot_values_and_drops_cached_collections() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let authors = harness.schema("authors");
    let books = harness.schema("books");

    let mut author = named(&authors, "name", "Brin");
    author.set("email", "brin@example.com").unwrap();
    session.save(&mut author).unwrap();
    let cached = session.collection(&author, "books").unwrap();
    cached.borrow_mut().add(named(&books, "title", "Startide Rising"));

    author.set("name", "David Brin").unwrap();
    author.clear("email").unwrap();
    assert!(session.is_dirty(&author).unwrap());

    session.reset(&mut author);

    assert_eq!(author.text("name"), Some("Brin"));
    assert_eq!(author.text("email"), Some("brin@example.com"));
    assert!(!session.is_dirty(&author).unwrap());
    let reloaded = session.collection(&author, "books").unwrap();
    assert!(!Rc::ptr_eq(&cached, &reloaded));
    assert!(reloaded.borrow().is_empty());
}

#[test]
fn refresh_picks_up_external_changes() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let authors = harness.schema("authors");

    let mut author = named(&authors, "name", "Stephenson");
    session.save(&mut author).unwrap();
    let id = author.id().unwrap();
    harness
        .conn
        .execute(
            "UPDATE authors SET name = 'Neal Stephenson' WHERE id = ?1;",
            [id.to_string()],
        )
        .unwrap();
    author.set("email", "local@example.com").unwrap();

    assert_eq!(session.refresh(&mut author).unwrap(), RefreshOutcome::Refreshed);
    assert_eq!(author.text("name"), Some("Neal Stephenson"));
    assert!(author.get("email").is_null());
    assert!(!session.is_dirty(&author).unwrap());

    harness
        .conn
        .execute("DELETE FROM authors WHERE id = ?1;", [id.to_string()])
        .unwrap();
    assert_eq!(session.refresh(&mut author).unwrap(), RefreshOutcome::Vanished);

    let mut transient = named(&authors, "name", "Nobody");
    assert_eq!(
        session.refresh(&mut transient).unwrap(),
        RefreshOutcome::NotStored
    );
}

#[test]
fn suspended_audit_produces_no_records() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store).with_config(SessionConfig {
        audit_suspended: true,
        ..SessionConfig::default()
    });
    let authors = harness.schema("authors");

    let mut author = named(&authors, "name", "Egan");
    session.save(&mut author).unwrap();
    assert!(harness.audit.is_empty());

    session.resume_audit();
    author.set("name", "Greg Egan").unwrap();
    session.save(&mut author).unwrap();
    assert_eq!(harness.audit.len(), 1);
}

#[test]
fn collection_changes_can_be_left_out_of_audit() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store).with_config(SessionConfig {
        audit_collections: false,
        ..SessionConfig::default()
    });
    let books = harness.schema("books");
    let tags = harness.schema("tags");

    let mut book = named(&books, "title", "Glasshouse");
    session.save(&mut book).unwrap();
    session
        .add_member(&book, "tags", named(&tags, "label", "post-human"))
        .unwrap();
    harness.audit.clear();

    assert_eq!(session.save(&mut book).unwrap(), SaveOutcome::Updated);
    assert!(harness
        .audit
        .records()
        .iter()
        .all(|record| record.table != "books"));
}

#[test]
fn sqlite_audit_log_commits_with_the_entity_writes() {
    let harness = Harness::new();
    let store = harness.backend();
    let audit_log = SqliteAuditLog::try_new(&harness.conn).unwrap();
    let mut session =
        Session::try_new(&store, &audit_log, &harness.errors, &harness.registry).unwrap();
    let authors = harness.schema("authors");
    let books = harness.schema("books");

    let mut author = named(&authors, "name", "Cherryh");
    session.save(&mut author).unwrap();
    author.set("name", "C. J. Cherryh").unwrap();
    session.save(&mut author).unwrap();

    let id = author.id().unwrap().to_string();
    let entries = audit_log.entries_for("authors", &id).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, ChangeKind::Created);
    assert_eq!(entries[1].kind, ChangeKind::Updated);
    assert_eq!(entries[1].events[0]["property"], "name");
    assert_eq!(entries[1].events[0]["old"], "Cherryh");
    assert_eq!(entries[1].events[0]["new"], "C. J. Cherryh");

    session
        .add_member(&author, "books", named(&books, "title", "Cyteen"))
        .unwrap();
    store.fail_writes_to("books");
    author.set("email", "cj@example.com").unwrap();
    assert!(session.save(&mut author).is_err());
    assert_eq!(audit_log.entries().unwrap().len(), 2);
}

#[test]
fn sqlite_audit_log_requires_migrated_connection() {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    let err = SqliteAuditLog::try_new(&conn).err().unwrap();
    assert!(matches!(err, StoreError::UninitializedConnection { .. }));

    let migrated = open_db_in_memory().unwrap();
    SqliteBackend::new(&migrated)
        .ensure_tables(&common::library_registry())
        .unwrap();
    assert!(SqliteAuditLog::try_new(&migrated).is_ok());
}
