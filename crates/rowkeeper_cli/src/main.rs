//! CLI walkthrough of one session lifecycle.
//!
//! # Responsibility
//! - Exercise save, update and delete against a real SQLite file or an
//!   in-memory database.
//! - Print the persisted audit trail so wiring problems are visible at once.
//!
//! Usage: `rowkeeper_cli [database-path]`. Set `ROWKEEPER_LOG_DIR` to an
//! absolute directory to enable file logging.

use rowkeeper_core::{
    open_db, open_db_in_memory, EntitySchema, LogErrorSink, LoggingConfig, OneToMany, ScalarType,
    SchemaRegistry, Session, SqliteAuditLog, SqliteBackend,
};
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    if let Ok(log_dir) = std::env::var("ROWKEEPER_LOG_DIR") {
        rowkeeper_core::init_logging(&LoggingConfig::new(log_dir))?;
    }

    let conn = match std::env::args().nth(1) {
        Some(path) => open_db(path)?,
        None => open_db_in_memory()?,
    };
    let registry = demo_registry()?;
    let store = SqliteBackend::new(&conn);
    store.ensure_tables(&registry)?;
    let audit = SqliteAuditLog::try_new(&conn)?;
    let errors = LogErrorSink;
    let mut session = Session::try_new(&store, &audit, &errors, &registry)?;

    let authors = registry.require("authors")?;
    let books = registry.require("books")?;

    let mut author = rowkeeper_core::Entity::new(&authors);
    author.set("name", "Mary Shelley")?;
    let mut book = rowkeeper_core::Entity::new(&books);
    book.set("title", "Frankenstein")?;
    session.add_member(&author, "books", book)?;
    println!("save author: {}", session.save(&mut author)?.as_str());

    author.set("name", "Mary Wollstonecraft Shelley")?;
    println!("update author: {}", session.save(&mut author)?.as_str());
    println!("delete author: {:?}", session.delete(&mut author)?);

    for entry in audit.entries()? {
        println!(
            "audit #{} {} {} {}",
            entry.seq,
            entry.kind,
            entry.table,
            entry.events
        );
    }
    println!("rowkeeper_core version={}", rowkeeper_core::core_version());
    Ok(())
}

fn demo_registry() -> Result<SchemaRegistry, Box<dyn Error>> {
    let mut registry = SchemaRegistry::new();
    registry.register(
        EntitySchema::builder("authors")
            .scalar("name", ScalarType::Text)
            .one_to_many("books", OneToMany::new("books", "author").inverse())
            .build()?,
    )?;
    registry.register(
        EntitySchema::builder("books")
            .scalar("title", ScalarType::Text)
            .foreign_key("author", "authors", true)
            .build()?,
    )?;
    Ok(registry)
}
