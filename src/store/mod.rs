//! SQLite persistence for threads, messages and activity snapshots.
//!
//! Reads go straight through [`Store`]; every write made by ingestion goes
//! through a [`Batch`], which wraps one transaction.

mod batch;
mod schema;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{Result, SyncError};
use crate::model::message::StoredMessage;
use crate::model::thread::{ThreadActivity, ThreadRecord, ThreadStatus};

pub use batch::{Batch, ThreadSummary};

const THREAD_COLUMNS: &str = "id, subject, first_message_id, first_author, first_author_email, \
     created_at, updated_at, last_message_at, message_count, unique_authors, status";

const MESSAGE_COLUMNS: &str = "id, thread_id, message_id, in_reply_to, refs, subject, author, \
     author_email, body, created_at, has_patch, patch_status";

/// Totals for the `stats` view.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub threads: u64,
    pub messages: u64,
    /// Distinct author emails across all messages.
    pub authors: u64,
    /// Messages flagged as carrying a patch.
    pub patches: u64,
    /// Thread count per status, in [`ThreadStatus::ALL`] order.
    pub by_status: Vec<(ThreadStatus, u64)>,
    pub latest_message_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// Handle to the ingestion database.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| SyncError::Store(format!("failed to open database: {e}")))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::Store(format!("failed to open in-memory database: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        schema::configure(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Start a write transaction.
    pub fn begin(&mut self) -> Result<Batch<'_>> {
        Ok(Batch::new(self.conn.transaction()?))
    }

    /// Remove every thread, message and activity snapshot.
    pub fn reset(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM thread_activities;
             DELETE FROM messages;
             DELETE FROM threads;",
        )?;
        tx.commit()?;
        tracing::info!("Store reset");
        Ok(())
    }

    /// Threads ordered by most recent activity, optionally filtered by status.
    pub fn list_threads(
        &self,
        status: Option<ThreadStatus>,
        limit: usize,
    ) -> Result<Vec<ThreadRecord>> {
        let sql = format!(
            "SELECT {THREAD_COLUMNS} FROM threads
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY last_message_at IS NULL, last_message_at DESC, id
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str()), limit], thread_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_thread(&self, id: &str) -> Result<Option<ThreadRecord>> {
        let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], thread_from_row)
            .optional()?)
    }

    /// Expand a unique id prefix to the full thread id.
    pub fn resolve_thread_id(&self, prefix: &str) -> Result<String> {
        let pattern = format!("{}%", prefix.replace(['%', '_'], ""));
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM threads WHERE id LIKE ?1 LIMIT 2")?;
        let ids = stmt
            .query_map(params![pattern], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        match ids.as_slice() {
            [] => Err(SyncError::ThreadNotFound(prefix.to_string())),
            [id] => Ok(id.clone()),
            _ => {
                let count: i64 = self.conn.query_row(
                    "SELECT COUNT(*) FROM threads WHERE id LIKE ?1",
                    params![pattern],
                    |row| row.get(0),
                )?;
                Err(SyncError::AmbiguousId(prefix.to_string(), count as usize))
            }
        }
    }

    /// Messages of a thread, oldest first.
    pub fn thread_messages(&self, thread_id: &str) -> Result<Vec<StoredMessage>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 ORDER BY created_at, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![thread_id], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Look up a message by its `Message-ID`.
    pub fn get_message(&self, message_id: &str) -> Result<Option<StoredMessage>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![message_id], message_from_row)
            .optional()?)
    }

    /// Latest activity snapshot of a thread.
    pub fn get_activity(&self, thread_id: &str) -> Result<Option<ThreadActivity>> {
        Ok(self
            .conn
            .query_row(
                "SELECT thread_id, message_count, unique_authors, has_patch, has_review,
                        days_since_last_message, created_at, updated_at
                 FROM thread_activities WHERE thread_id = ?1",
                params![thread_id],
                |row| {
                    Ok(ThreadActivity {
                        thread_id: row.get(0)?,
                        message_count: row.get(1)?,
                        unique_authors: row.get(2)?,
                        has_patch: row.get(3)?,
                        has_review: row.get(4)?,
                        days_since_last_message: row.get(5)?,
                        created_at: parse_datetime(&row.get::<_, String>(6)?)?,
                        updated_at: parse_datetime(&row.get::<_, String>(7)?)?,
                    })
                },
            )
            .optional()?)
    }

    /// Date of the newest persisted message.
    pub fn latest_message_at(&self) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<String> =
            self.conn
                .query_row("SELECT MAX(created_at) FROM messages", [], |row| row.get(0))?;
        Ok(latest.as_deref().map(parse_datetime).transpose()?)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let (threads, last_updated): (i64, Option<String>) = self.conn.query_row(
            "SELECT COUNT(*), MAX(updated_at) FROM threads",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (messages, authors, patches): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT author_email), COALESCE(SUM(has_patch), 0)
             FROM messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM threads GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let by_status = ThreadStatus::ALL
            .iter()
            .map(|status| {
                let count = counts
                    .iter()
                    .find(|(name, _)| name == status.as_str())
                    .map_or(0, |(_, n)| *n as u64);
                (*status, count)
            })
            .collect();

        Ok(StoreStats {
            threads: threads as u64,
            messages: messages as u64,
            authors: authors as u64,
            patches: patches as u64,
            by_status,
            latest_message_at: self.latest_message_at()?,
            last_updated_at: last_updated.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadRecord> {
    Ok(ThreadRecord {
        id: row.get(0)?,
        subject: row.get(1)?,
        first_message_id: row.get(2)?,
        first_author: row.get(3)?,
        first_author_email: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?)?,
        updated_at: parse_datetime(&row.get::<_, String>(6)?)?,
        last_message_at: row
            .get::<_, Option<String>>(7)?
            .as_deref()
            .map(parse_datetime)
            .transpose()?,
        message_count: row.get(8)?,
        unique_authors: row.get(9)?,
        status: parse_text(10, &row.get::<_, String>(10)?)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let refs: String = row.get(4)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        message_id: row.get(2)?,
        in_reply_to: row.get(3)?,
        references: serde_json::from_str(&refs)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        subject: row.get(5)?,
        author: row.get(6)?,
        author_email: row.get(7)?,
        body: row.get(8)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?)?,
        has_patch: row.get(10)?,
        patch_status: row
            .get::<_, Option<String>>(11)?
            .map(|s| parse_text(11, &s))
            .transpose()?,
    })
}

fn parse_text<T: FromStr<Err = String>>(column: usize, value: &str) -> rusqlite::Result<T> {
    value
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, e.into()))
}

pub(crate) fn parse_datetime(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .map(|ndt| ndt.and_utc())
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

/// Stored form of a timestamp; sorts lexicographically in time order.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_datetime_format_roundtrip_and_order() {
        let a = Utc.with_ymd_and_hms(2024, 1, 4, 9, 5, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 11, 4, 10, 0, 0).unwrap();
        assert_eq!(parse_datetime(&format_datetime(&a)).unwrap(), a);
        assert!(format_datetime(&a) < format_datetime(&b));
    }

    #[test]
    fn test_empty_store_queries() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.list_threads(None, 10).unwrap().is_empty());
        assert!(store.get_thread("nope").unwrap().is_none());
        assert!(store.get_message("nope@x").unwrap().is_none());
        assert!(store.latest_message_at().unwrap().is_none());
        assert!(matches!(
            store.resolve_thread_id("abc"),
            Err(SyncError::ThreadNotFound(_))
        ));

        let stats = store.stats().unwrap();
        assert_eq!(stats.threads, 0);
        assert_eq!(stats.by_status.len(), ThreadStatus::ALL.len());
        assert!(stats.by_status.iter().all(|(_, n)| *n == 0));
    }

    #[test]
    fn test_open_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.db");
        Store::open(&path).unwrap();
        assert!(path.exists());
    }
}
