//! Transactional write access used by the reconciler.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use super::{format_datetime, parse_datetime};
use crate::error::Result;
use crate::model::message::MessageRecord;
use crate::model::thread::{ThreadActivity, ThreadRecord, ThreadStatus};

/// Aggregates of one persisted thread, as recomputed from its messages.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSummary {
    pub id: String,
    pub message_count: u32,
    pub unique_authors: u32,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// One write transaction. Dropped without [`Batch::commit`], it rolls back.
pub struct Batch<'a> {
    tx: Transaction<'a>,
}

impl<'a> Batch<'a> {
    pub(super) fn new(tx: Transaction<'a>) -> Self {
        Self { tx }
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    /// Thread created for this root id, if any.
    pub fn thread_by_first_message(&self, first_message_id: &str) -> Result<Option<String>> {
        Ok(self
            .tx
            .query_row(
                "SELECT id FROM threads WHERE first_message_id = ?1 ORDER BY created_at, id LIMIT 1",
                params![first_message_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Thread a persisted message currently belongs to.
    pub fn thread_of_message(&self, message_id: &str) -> Result<Option<String>> {
        Ok(self
            .tx
            .query_row(
                "SELECT thread_id FROM messages WHERE message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn insert_thread(&self, thread: &ThreadRecord) -> Result<()> {
        self.tx.execute(
            "INSERT INTO threads (id, subject, first_message_id, first_author, first_author_email,
                                  created_at, updated_at, last_message_at, message_count,
                                  unique_authors, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                thread.id,
                thread.subject,
                thread.first_message_id,
                thread.first_author,
                thread.first_author_email,
                format_datetime(&thread.created_at),
                format_datetime(&thread.updated_at),
                thread.last_message_at.as_ref().map(format_datetime),
                thread.message_count,
                thread.unique_authors,
                thread.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Insert a message, or move an existing one (same `Message-ID`) to
    /// `thread_id` and refresh its patch fields.
    ///
    /// Returns `true` when a new row was inserted.
    pub fn upsert_message(
        &self,
        thread_id: &str,
        message: &MessageRecord,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now = format_datetime(&now);
        let patch_status = message.patch_status.map(|s| s.as_str());

        if self.thread_of_message(&message.message_id)?.is_some() {
            self.tx.execute(
                "UPDATE messages SET thread_id = ?1, has_patch = ?2, patch_status = ?3, updated_at = ?4
                 WHERE message_id = ?5",
                params![thread_id, message.has_patch, patch_status, now, message.message_id],
            )?;
            return Ok(false);
        }

        let refs = serde_json::to_string(&message.references).unwrap_or_else(|_| "[]".to_string());
        self.tx.execute(
            "INSERT INTO messages (id, thread_id, message_id, in_reply_to, refs, subject, author,
                                   author_email, body, created_at, has_patch, patch_status,
                                   inserted_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                uuid::Uuid::new_v4().to_string(),
                thread_id,
                message.message_id,
                message.in_reply_to,
                refs,
                message.subject,
                message.author_name(),
                message.author_email(),
                message.body,
                format_datetime(&message.date),
                message.has_patch,
                patch_status,
                now,
            ],
        )?;
        Ok(true)
    }

    /// Bump `updated_at` on a thread touched by the current batch.
    pub fn touch_thread(&self, thread_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.tx.execute(
            "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
            params![format_datetime(&now), thread_id],
        )?;
        Ok(())
    }

    /// Recompute count, distinct authors and last activity of every thread
    /// from its persisted messages, then delete threads left empty.
    ///
    /// Returns the number of deleted threads.
    pub fn recompute_aggregates(&self) -> Result<usize> {
        self.tx.execute(
            "UPDATE threads SET
                message_count = (SELECT COUNT(*) FROM messages m WHERE m.thread_id = threads.id),
                unique_authors = (SELECT COUNT(DISTINCT m.author_email) FROM messages m
                                  WHERE m.thread_id = threads.id),
                last_message_at = (SELECT MAX(m.created_at) FROM messages m
                                   WHERE m.thread_id = threads.id)",
            [],
        )?;
        self.tx.execute(
            "DELETE FROM thread_activities
             WHERE thread_id IN (SELECT id FROM threads WHERE message_count = 0)",
            [],
        )?;
        let deleted = self
            .tx
            .execute("DELETE FROM threads WHERE message_count = 0", [])?;
        Ok(deleted)
    }

    /// Every persisted thread with its current aggregates.
    pub fn thread_summaries(&self) -> Result<Vec<ThreadSummary>> {
        let mut stmt = self.tx.prepare(
            "SELECT id, message_count, unique_authors, last_message_at FROM threads",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ThreadSummary {
                    id: row.get(0)?,
                    message_count: row.get(1)?,
                    unique_authors: row.get(2)?,
                    last_message_at: row
                        .get::<_, Option<String>>(3)?
                        .as_deref()
                        .map(parse_datetime)
                        .transpose()?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Visit `(body, has_patch)` of every message in a thread without
    /// collecting them.
    pub fn for_each_message_body(
        &self,
        thread_id: &str,
        mut visit: impl FnMut(&str, bool),
    ) -> Result<()> {
        let mut stmt = self
            .tx
            .prepare_cached("SELECT body, has_patch FROM messages WHERE thread_id = ?1")?;
        let mut rows = stmt.query(params![thread_id])?;
        while let Some(row) = rows.next()? {
            let body: String = row.get(0)?;
            visit(&body, row.get(1)?);
        }
        Ok(())
    }

    /// Store a thread's status and its activity snapshot.
    pub fn write_classification(&self, activity: &ThreadActivity, status: ThreadStatus) -> Result<()> {
        self.tx.execute(
            "UPDATE threads SET status = ?1 WHERE id = ?2",
            params![status.as_str(), activity.thread_id],
        )?;
        self.tx.execute(
            "INSERT INTO thread_activities (thread_id, message_count, unique_authors, has_patch,
                                            has_review, days_since_last_message, created_at,
                                            updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(thread_id) DO UPDATE SET
                message_count = excluded.message_count,
                unique_authors = excluded.unique_authors,
                has_patch = excluded.has_patch,
                has_review = excluded.has_review,
                days_since_last_message = excluded.days_since_last_message,
                updated_at = excluded.updated_at",
            params![
                activity.thread_id,
                activity.message_count,
                activity.unique_authors,
                activity.has_patch,
                activity.has_review,
                activity.days_since_last_message,
                format_datetime(&activity.created_at),
                format_datetime(&activity.updated_at),
            ],
        )?;
        Ok(())
    }
}
