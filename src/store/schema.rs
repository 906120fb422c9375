//! SQLite schema and migrations.

use rusqlite::Connection;

use crate::error::{Result, SyncError};

const MIGRATION_V1: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS threads (
    id                 TEXT PRIMARY KEY,
    subject            TEXT NOT NULL,
    first_message_id   TEXT NOT NULL,
    first_author       TEXT NOT NULL,
    first_author_email TEXT NOT NULL,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    last_message_at    TEXT,
    message_count      INTEGER NOT NULL DEFAULT 0,
    unique_authors     INTEGER NOT NULL DEFAULT 0,
    status             TEXT NOT NULL DEFAULT 'discussion'
);

CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY,
    thread_id    TEXT NOT NULL REFERENCES threads(id),
    message_id   TEXT NOT NULL UNIQUE,
    in_reply_to  TEXT,
    refs         TEXT NOT NULL DEFAULT '[]',
    subject      TEXT NOT NULL,
    author       TEXT NOT NULL,
    author_email TEXT NOT NULL,
    body         TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    has_patch    INTEGER NOT NULL DEFAULT 0,
    patch_status TEXT,
    inserted_at  TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS thread_activities (
    thread_id               TEXT PRIMARY KEY REFERENCES threads(id),
    message_count           INTEGER NOT NULL,
    unique_authors          INTEGER NOT NULL,
    has_patch               INTEGER NOT NULL,
    has_review              INTEGER NOT NULL,
    days_since_last_message INTEGER NOT NULL,
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_thread_id ON messages(thread_id);
CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);
CREATE INDEX IF NOT EXISTS idx_threads_status ON threads(status);
CREATE INDEX IF NOT EXISTS idx_threads_last_message_at ON threads(last_message_at);
CREATE INDEX IF NOT EXISTS idx_threads_first_message_id ON threads(first_message_id);

INSERT INTO schema_version (version) VALUES (1);
";

/// Apply connection pragmas.
///
/// Foreign keys stay off; the reconciler removes dependent rows itself.
pub(crate) fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = OFF;",
    )
    .map_err(|e| SyncError::Store(format!("failed to configure database: {e}")))
}

fn current_version(conn: &Connection) -> Result<i64> {
    let has_table: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    if !has_table {
        return Ok(0);
    }
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?)
}

/// Bring the schema up to the latest version.
pub(crate) fn migrate(conn: &Connection) -> Result<()> {
    let version = current_version(conn)?;
    if version < 1 {
        conn.execute_batch(MIGRATION_V1)
            .map_err(|e| SyncError::Store(format!("migration v1 failed: {e}")))?;
        tracing::debug!("Applied schema migration v1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 1);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('threads', 'messages', 'thread_activities')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
