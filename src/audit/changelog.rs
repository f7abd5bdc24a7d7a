use anyhow::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::trigger::AuditConfig;

/// Operation codes recorded by the log producer, one character per header
/// row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "I")]
    Insert,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
}

/// One header row of the change log, with its field details attached.
/// Immutable once written; the reversion engine consumes it read-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: i64,
    #[serde(rename = "type")]
    pub op: Operation,
    pub table_name: String,
    pub pk: String,
    pub update_date: String,
    pub user_name: String,
    #[serde(skip)]
    pub fields: Vec<FieldChange>,
}

/// One per-column detail row. For deletes the producer stores the pre-delete
/// content in `new_value`, and the reversion engine reads it from there.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FieldChange {
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Creates the change log tables if they do not exist: the header table, the
/// detail table, and the single-row actor context table the triggers read
/// the user name from.
pub fn init_log_tables(conn: &Connection, config: &AuditConfig) -> Result<()> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS \"{audit}\" (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            type        TEXT NOT NULL CHECK (type IN ('I', 'U', 'D')),
            table_name  TEXT NOT NULL CHECK (length(table_name) <= 75),
            pk          TEXT NOT NULL CHECK (length(pk) <= 20),
            update_date TEXT NOT NULL,
            user_name   TEXT NOT NULL CHECK (length(user_name) <= 64)
        );

        CREATE TABLE IF NOT EXISTS \"{detail}\" (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            audit_id   INTEGER NOT NULL REFERENCES \"{audit}\" (id),
            field_name TEXT NOT NULL CHECK (length(field_name) <= 75),
            old_value  TEXT,
            new_value  TEXT
        );

        CREATE INDEX IF NOT EXISTS \"{detail}_audit_id\" ON \"{detail}\" (audit_id);

        CREATE TABLE IF NOT EXISTS \"{context}\" (
            id        INTEGER PRIMARY KEY CHECK (id = 1),
            user_name TEXT NOT NULL
        );
        ",
        audit = config.audit_table,
        detail = config.detail_table,
        context = config.context_table(),
    ))?;
    Ok(())
}

/// Stamps the actor name recorded on subsequent log entries. Truncated to
/// the log's 64 character user column.
pub fn set_audit_user(conn: &Connection, config: &AuditConfig, user_name: &str) -> Result<()> {
    let user_name: String = user_name.chars().take(64).collect();
    conn.execute(
        &format!(
            "INSERT INTO \"{context}\" (id, user_name) VALUES (1, ?1)
             ON CONFLICT (id) DO UPDATE SET user_name = excluded.user_name",
            context = config.context_table(),
        ),
        [&user_name],
    )?;
    Ok(())
}

/// The highest sequence id currently in the log, or 0 when the log is empty.
/// Captured at session open as the checkpoint.
pub fn max_sequence(conn: &Connection, config: &AuditConfig) -> Result<i64> {
    let id = conn.query_row(
        &format!("SELECT COALESCE(MAX(id), 0) FROM \"{}\"", config.audit_table),
        [],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Reads every log entry above the checkpoint, newest first, with its detail
/// rows attached. The descending order is what lets the merger resolve each
/// field to its most recent state in a single pass.
pub fn read_since(
    conn: &Connection,
    config: &AuditConfig,
    checkpoint: i64,
) -> Result<Vec<ChangeLogEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, type, table_name, pk, update_date, user_name
         FROM \"{}\"
         WHERE id > ?1
         ORDER BY id DESC",
        config.audit_table
    ))?;
    let mut entries = serde_rusqlite::from_rows::<ChangeLogEntry>(stmt.query([checkpoint])?)
        .collect::<Result<Vec<_>, _>>()?;

    let mut detail_stmt = conn.prepare(&format!(
        "SELECT field_name, old_value, new_value
         FROM \"{}\"
         WHERE audit_id = ?1
         ORDER BY id",
        config.detail_table
    ))?;
    for entry in &mut entries {
        entry.fields = serde_rusqlite::from_rows::<FieldChange>(detail_stmt.query([entry.id])?)
            .collect::<Result<Vec<_>, _>>()?;
    }

    Ok(entries)
}

/// Removes every log row above the checkpoint, details before headers so the
/// foreign key holds. Returns (detail rows, header rows) removed.
pub fn prune(conn: &Connection, config: &AuditConfig, checkpoint: i64) -> Result<(usize, usize)> {
    let details = conn.execute(
        &format!("DELETE FROM \"{}\" WHERE audit_id > ?1", config.detail_table),
        [checkpoint],
    )?;
    let headers = conn.execute(
        &format!("DELETE FROM \"{}\" WHERE id > ?1", config.audit_table),
        [checkpoint],
    )?;
    log::debug!(
        "pruned {} detail rows and {} header rows above checkpoint {}",
        details,
        headers,
        checkpoint
    );
    Ok((details, headers))
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;

    fn log_db() -> anyhow::Result<(Connection, AuditConfig)> {
        let conn = Connection::open_in_memory()?;
        let config = AuditConfig::default();
        init_log_tables(&conn, &config)?;
        Ok((conn, config))
    }

    fn write_entry(
        conn: &Connection,
        op: &str,
        table: &str,
        pk: &str,
        fields: &[(&str, Option<&str>, Option<&str>)],
    ) -> anyhow::Result<i64> {
        conn.execute(
            "INSERT INTO _audit (type, table_name, pk, update_date, user_name)
             VALUES (?1, ?2, ?3, datetime('now'), 'tester')",
            [op, table, pk],
        )?;
        let audit_id = conn.last_insert_rowid();
        for (name, old, new) in fields {
            conn.execute(
                "INSERT INTO _audit_detail (audit_id, field_name, old_value, new_value)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![audit_id, name, old, new],
            )?;
        }
        Ok(audit_id)
    }

    #[test]
    fn read_since_is_newest_first_with_details() -> anyhow::Result<()> {
        let (conn, config) = log_db()?;
        write_entry(&conn, "I", "main.T", "1", &[("name", None, Some("Alice"))])?;
        write_entry(
            &conn,
            "U",
            "main.T",
            "1",
            &[("name", Some("Alice"), Some("Bob"))],
        )?;
        write_entry(&conn, "D", "main.T", "1", &[("name", None, Some("Bob"))])?;

        let entries = read_since(&conn, &config, 0)?;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].op, Operation::Delete);
        assert_eq!(entries[1].op, Operation::Update);
        assert_eq!(entries[2].op, Operation::Insert);
        assert!(entries[0].id > entries[1].id && entries[1].id > entries[2].id);

        assert_eq!(entries[1].fields.len(), 1);
        assert_eq!(entries[1].fields[0].field_name, "name");
        assert_eq!(entries[1].fields[0].old_value.as_deref(), Some("Alice"));
        assert_eq!(entries[1].fields[0].new_value.as_deref(), Some("Bob"));

        Ok(())
    }

    #[test]
    fn read_since_respects_the_checkpoint() -> anyhow::Result<()> {
        let (conn, config) = log_db()?;
        let first = write_entry(&conn, "I", "main.T", "1", &[])?;
        write_entry(&conn, "I", "main.T", "2", &[])?;

        let entries = read_since(&conn, &config, first)?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pk, "2");

        Ok(())
    }

    #[test]
    fn max_sequence_of_empty_log_is_zero() -> anyhow::Result<()> {
        let (conn, config) = log_db()?;
        assert_eq!(max_sequence(&conn, &config)?, 0);
        write_entry(&conn, "I", "main.T", "1", &[])?;
        assert_eq!(max_sequence(&conn, &config)?, 1);
        Ok(())
    }

    #[test]
    fn prune_removes_only_rows_above_the_checkpoint() -> anyhow::Result<()> {
        let (conn, config) = log_db()?;
        let checkpoint = write_entry(&conn, "I", "main.T", "1", &[("a", None, Some("1"))])?;
        write_entry(&conn, "U", "main.T", "1", &[("a", Some("1"), Some("2"))])?;
        write_entry(&conn, "D", "main.T", "1", &[("a", None, Some("2"))])?;

        let (details, headers) = prune(&conn, &config, checkpoint)?;
        assert_eq!(headers, 2);
        assert_eq!(details, 2);

        assert_eq!(max_sequence(&conn, &config)?, checkpoint);
        let remaining = read_since(&conn, &config, 0)?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].fields.len(), 1);

        Ok(())
    }

    #[test]
    fn set_audit_user_truncates_and_overwrites() -> anyhow::Result<()> {
        let (conn, config) = log_db()?;
        set_audit_user(&conn, &config, "alice")?;
        set_audit_user(&conn, &config, &"b".repeat(100))?;

        let user: String = conn.query_row(
            "SELECT user_name FROM _audit_context WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(user.len(), 64);
        Ok(())
    }
}
