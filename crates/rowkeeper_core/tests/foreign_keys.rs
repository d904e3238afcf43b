mod common;

use common::{named, Harness};
use rowkeeper_core::{Condition, Entity, FailureReason, LazyRef, SaveOutcome, Value};
use uuid::Uuid;

#[test]
fn reference_to_unsaved_target_blocks_every_write() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let authors = harness.schema("authors");
    let books = harness.schema("books");

    let author = named(&authors, "name", "Zelazny");
    let mut book = named(&books, "title", "Lord of Light");
    book.set_reference("author", &author).unwrap();

    let SaveOutcome::Invalid(report) = session.save(&mut book).unwrap() else {
        panic!("expected invalid outcome");
    };
    assert_eq!(report.table, "books");
    assert_eq!(report.failure("author"), Some(FailureReason::TargetNotStored));
    assert!(book.is_transient());
    assert_eq!(store.write_count(), 0);
    assert!(harness.audit.is_empty());
    assert_eq!(session.invalid_entities().len(), 1);
}

#[test]
fn saving_the_target_first_makes_an_early_reference_valid() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let authors = harness.schema("authors");
    let books = harness.schema("books");

    let mut author = named(&authors, "name", "Zelazny");
    let mut book = named(&books, "title", "Lord of Light");
    book.set_reference("author", &author).unwrap();
    assert!(matches!(
        session.save(&mut book).unwrap(),
        SaveOutcome::Invalid(_)
    ));

    session.save(&mut author).unwrap();
    assert_eq!(session.save(&mut book).unwrap(), SaveOutcome::Created);
    assert!(session.invalid_entities().is_empty());

    let row = harness.row("books", book.id().unwrap()).unwrap();
    assert_eq!(
        row.reference("author").and_then(LazyRef::id),
        author.id()
    );
}

#[test]
fn required_reference_must_be_set() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let chapters = harness.schema("chapters");

    let mut chapter = named(&chapters, "title", "Orphan");
    let SaveOutcome::Invalid(report) = session.save(&mut chapter).unwrap() else {
        panic!("expected invalid outcome");
    };
    assert_eq!(report.failure("book"), Some(FailureReason::Unset));
    assert_eq!(report.fields().collect::<Vec<_>>(), vec!["book"]);
    assert_eq!(harness.count_rows("chapters"), 0);

    session.clear_invalid();
    assert!(session.invalid_entities().is_empty());
}

#[test]
fn loaded_reference_resolves_lazily_through_the_session() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let authors = harness.schema("authors");
    let books = harness.schema("books");

    let mut author = named(&authors, "name", "Bester");
    session.save(&mut author).unwrap();
    let mut book = named(&books, "title", "The Stars My Destination");
    book.set_reference("author", &author).unwrap();
    session.save(&mut book).unwrap();

    let mut loaded = session.load("books", book.id().unwrap()).unwrap().unwrap();
    let reference = loaded.reference_mut("author").unwrap();
    assert!(!reference.is_resolved());

    let target = reference.resolve(&mut session).unwrap().unwrap();
    assert_eq!(target.text("name"), Some("Bester"));
    assert!(reference.is_resolved());
}

#[test]
fn dangling_reference_stays_unresolved() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);

    let mut reference = LazyRef::unresolved("authors", Uuid::new_v4());
    assert!(reference.resolve(&mut session).unwrap().is_none());
    assert!(!reference.is_resolved());
}

#[test]
fn bulk_insert_writes_valid_rows_and_reports_the_rest() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let authors = harness.schema("authors");
    let chapters = harness.schema("chapters");

    let mut batch: Vec<Entity> = ["Asimov", "Clarke", "Heinlein"]
        .into_iter()
        .map(|name| named(&authors, "name", name))
        .collect();
    let mut orphans = vec![named(&chapters, "title", "Loose")];

    let report = session.bulk_insert(&mut batch).unwrap();
    assert_eq!(report.inserted, 3);
    assert!(report.invalid.is_empty());
    assert!(batch.iter().all(Entity::is_stored));
    assert_eq!(harness.count_rows("authors"), 3);
    assert!(harness.audit.is_empty());

    let report = session.bulk_insert(&mut orphans).unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.invalid.len(), 1);
    assert!(orphans[0].is_transient());

    let again = session.bulk_insert(&mut batch).unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(harness.count_rows("authors"), 3);

    assert!(!session.is_dirty(&batch[0]).unwrap());
}

#[test]
fn find_where_filters_on_references_and_nulls() {
    let harness = Harness::new();
    let store = harness.backend();
    let mut session = harness.session(&store);
    let authors = harness.schema("authors");
    let books = harness.schema("books");

    let mut author = named(&authors, "name", "Tepper");
    session.save(&mut author).unwrap();
    let mut owned = named(&books, "title", "Grass");
    owned.set_reference("author", &author).unwrap();
    session.save(&mut owned).unwrap();
    let mut anonymous = named(&books, "title", "Beauty");
    session.save(&mut anonymous).unwrap();

    let by_author = session
        .find_where("books", &[Condition::eq("author", LazyRef::to(&author))])
        .unwrap();
    assert_eq!(by_author.len(), 1);
    assert_eq!(by_author[0].id(), owned.id());

    let unowned = session
        .find_where("books", &[Condition::eq("author", Value::Null)])
        .unwrap();
    assert_eq!(unowned.len(), 1);
    assert_eq!(unowned[0].text("title"), Some("Beauty"));
}
