//! Audit sink persisting change records to the `audit_log` table.
//!
//! # Invariants
//! - Records are written on the session's connection, so they commit or roll
//!   back together with the entity writes they describe.
//! - `events` holds a JSON array of `{property, old, new}` objects.

use crate::audit::{AuditSink, ChangeKind, TraceEvent};
use crate::db::migrations::latest_version;
use crate::db::schema_version;
use crate::model::entity::Entity;
use crate::repo::{StoreError, StoreResult};
use rusqlite::{params, Connection, Row};

const AUDIT_TABLE: &str = "audit_log";

/// Persisted audit entry as read back from `audit_log`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub seq: i64,
    pub table: String,
    pub entity_id: Option<String>,
    pub kind: ChangeKind,
    pub events: serde_json::Value,
    pub recorded_at: i64,
}

pub struct SqliteAuditLog<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteAuditLog<'conn> {
    /// Wraps a connection after checking that framework migrations ran.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        ensure_audit_connection_ready(conn)?;
        Ok(Self { conn })
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> StoreResult<Vec<AuditEntry>> {
        self.query_entries(None)
    }

    /// Entries of one row, oldest first.
    pub fn entries_for(&self, table: &str, entity_id: &str) -> StoreResult<Vec<AuditEntry>> {
        self.query_entries(Some((table, entity_id)))
    }

    fn query_entries(&self, filter: Option<(&str, &str)>) -> StoreResult<Vec<AuditEntry>> {
        let base = "SELECT seq, entity_table, entity_id, change_kind, events, recorded_at
                    FROM audit_log";
        let mut entries = Vec::new();
        match filter {
            Some((table, entity_id)) => {
                let mut stmt = self.conn.prepare(&format!(
                    "{base} WHERE entity_table = ?1 AND entity_id = ?2 ORDER BY seq ASC;"
                ))?;
                let mut rows = stmt.query(params![table, entity_id])?;
                while let Some(row) = rows.next()? {
                    entries.push(parse_entry(row)?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(&format!("{base} ORDER BY seq ASC;"))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    entries.push(parse_entry(row)?);
                }
            }
        }
        Ok(entries)
    }
}

impl AuditSink for SqliteAuditLog<'_> {
    fn record(&self, entity: &Entity, kind: ChangeKind, events: &[TraceEvent]) -> StoreResult<()> {
        let payload = serde_json::to_string(events)
            .map_err(|err| StoreError::InvalidData(format!("unencodable audit events: {err}")))?;
        self.conn.execute(
            "INSERT INTO audit_log (entity_table, entity_id, change_kind, events)
             VALUES (?1, ?2, ?3, ?4);",
            params![
                entity.table(),
                entity.id().map(|id| id.to_string()),
                kind.as_str(),
                payload,
            ],
        )?;
        Ok(())
    }
}

fn parse_entry(row: &Row<'_>) -> StoreResult<AuditEntry> {
    let kind_raw: String = row.get(3)?;
    let events_raw: String = row.get(4)?;
    Ok(AuditEntry {
        seq: row.get(0)?,
        table: row.get(1)?,
        entity_id: row.get(2)?,
        kind: parse_kind(&kind_raw)?,
        events: serde_json::from_str(&events_raw)
            .map_err(|err| StoreError::InvalidData(format!("audit events: {err}")))?,
        recorded_at: row.get(5)?,
    })
}

fn parse_kind(raw: &str) -> StoreResult<ChangeKind> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|err| StoreError::InvalidData(format!("change kind `{raw}`: {err}")))
}

fn ensure_audit_connection_ready(conn: &Connection) -> StoreResult<()> {
    let expected_version = latest_version();
    let actual_version = schema_version(conn)?;
    if actual_version != expected_version {
        return Err(StoreError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [AUDIT_TABLE],
        |row| row.get(0),
    )?;
    if exists != 1 {
        return Err(StoreError::MissingRequiredTable(AUDIT_TABLE));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kind_accepts_stored_names_and_rejects_others() {
        assert_eq!(parse_kind("created").unwrap(), ChangeKind::Created);
        assert_eq!(parse_kind("deleted").unwrap(), ChangeKind::Deleted);
        assert!(matches!(
            parse_kind("renamed"),
            Err(StoreError::InvalidData(_))
        ));
    }
}
