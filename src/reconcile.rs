//! Merge threaded batches into the store.
//!
//! Each call runs in one transaction: locate or create a thread per group,
//! upsert members by `Message-ID`, recompute every thread's aggregates from
//! its persisted messages, drop empty threads and reclassify everything.
//! The recompute pass costs O(threads) per batch and tolerates messages
//! moving between threads across batches.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::{classify, days_since, scan_keywords, KeywordHits, ThreadFeatures};
use crate::error::Result;
use crate::model::message::MessageRecord;
use crate::model::thread::{ThreadActivity, ThreadGroup, ThreadRecord, ThreadStatus};
use crate::store::{Batch, Store};

/// Counters for one reconciled batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub groups: usize,
    /// Messages that were not persisted before.
    pub inserted: usize,
    /// Already persisted messages whose thread and patch fields were refreshed.
    pub updated: usize,
    pub threads_created: usize,
    pub threads_deleted: usize,
    /// Records skipped because of a store error.
    pub errors: usize,
}

impl ReconcileReport {
    pub fn merge(&mut self, other: &ReconcileReport) {
        self.groups += other.groups;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.threads_created += other.threads_created;
        self.threads_deleted += other.threads_deleted;
        self.errors += other.errors;
    }
}

/// Merge `groups` into the store, classifying against the current time.
pub fn reconcile(store: &mut Store, groups: Vec<ThreadGroup>) -> Result<ReconcileReport> {
    reconcile_at(store, groups, Utc::now())
}

/// Merge `groups` into the store as of `now`.
pub fn reconcile_at(
    store: &mut Store,
    groups: Vec<ThreadGroup>,
    now: DateTime<Utc>,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport {
        groups: groups.len(),
        ..Default::default()
    };
    let batch = store.begin()?;

    for group in &groups {
        let thread_id = match locate_thread(&batch, group) {
            Ok(Some(id)) => id,
            Ok(None) => match create_thread(&batch, group, now) {
                Ok(Some(id)) => {
                    report.threads_created += 1;
                    id
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(root = %group.root_id, error = %e, "Failed to create thread");
                    report.errors += 1;
                    continue;
                }
            },
            Err(e) => {
                warn!(root = %group.root_id, error = %e, "Failed to look up thread");
                report.errors += 1;
                continue;
            }
        };

        for member in &group.members {
            let member = sanitize_record(member);
            match batch.upsert_message(&thread_id, &member, now) {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.updated += 1,
                Err(e) => {
                    warn!(message_id = %member.message_id, error = %e, "Failed to store message");
                    report.errors += 1;
                }
            }
        }

        if let Err(e) = batch.touch_thread(&thread_id, now) {
            warn!(thread_id = %thread_id, error = %e, "Failed to touch thread");
        }
    }

    report.threads_deleted = batch.recompute_aggregates()?;
    let classified = reclassify_all(&batch, now)?;
    batch.commit()?;

    info!(
        groups = report.groups,
        inserted = report.inserted,
        updated = report.updated,
        threads_created = report.threads_created,
        threads_deleted = report.threads_deleted,
        classified,
        errors = report.errors,
        "Reconciled batch"
    );
    Ok(report)
}

/// Find the persisted thread a group belongs to.
///
/// Tried in order: a thread created for the same root id, the thread of the
/// root message itself, the thread of any member already persisted.
fn locate_thread(batch: &Batch<'_>, group: &ThreadGroup) -> Result<Option<String>> {
    if let Some(id) = batch.thread_by_first_message(&group.root_id)? {
        return Ok(Some(id));
    }
    if let Some(id) = batch.thread_of_message(&group.root_id)? {
        debug!(root = %group.root_id, thread_id = %id, "Adopted thread of persisted root");
        return Ok(Some(id));
    }
    for member in &group.members {
        if let Some(id) = batch.thread_of_message(&member.message_id)? {
            debug!(
                root = %group.root_id,
                message_id = %member.message_id,
                thread_id = %id,
                "Adopted thread of persisted member"
            );
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// Create a thread anchored at the group's earliest member.
fn create_thread(
    batch: &Batch<'_>,
    group: &ThreadGroup,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let Some(first) = group.earliest() else {
        return Ok(None);
    };

    let thread = ThreadRecord {
        id: uuid::Uuid::new_v4().to_string(),
        subject: sanitize_text(&first.subject).into_owned(),
        first_message_id: group.root_id.clone(),
        first_author: sanitize_text(first.author_name()).into_owned(),
        first_author_email: sanitize_text(first.author_email()).into_owned(),
        created_at: first.date,
        updated_at: now,
        last_message_at: None,
        message_count: 0,
        unique_authors: 0,
        status: ThreadStatus::Discussion,
    };
    batch.insert_thread(&thread)?;
    Ok(Some(thread.id))
}

/// Reclassify every thread and rewrite its activity snapshot.
fn reclassify_all(batch: &Batch<'_>, now: DateTime<Utc>) -> Result<usize> {
    let summaries = batch.thread_summaries()?;
    for summary in &summaries {
        let mut hits = KeywordHits::default();
        batch.for_each_message_body(&summary.id, |body, flagged| {
            let found = scan_keywords([body]);
            hits.has_patch |= found.has_patch || flagged;
            hits.has_review |= found.has_review;
        })?;

        let days = days_since(summary.last_message_at, now);
        let status = classify(&ThreadFeatures {
            has_patch: hits.has_patch,
            has_review: hits.has_review,
            message_count: summary.message_count,
            days_since_last_activity: days,
        });

        batch.write_classification(
            &ThreadActivity {
                thread_id: summary.id.clone(),
                message_count: summary.message_count,
                unique_authors: summary.unique_authors,
                has_patch: hits.has_patch,
                has_review: hits.has_review,
                days_since_last_message: days.floor() as i64,
                created_at: now,
                updated_at: now,
            },
            status,
        )?;
    }
    Ok(summaries.len())
}

/// Strip NUL bytes and replacement characters left over from lossy decoding.
pub fn sanitize_text(s: &str) -> Cow<'_, str> {
    if s.contains(['\0', '\u{FFFD}']) {
        Cow::Owned(s.chars().filter(|c| !matches!(c, '\0' | '\u{FFFD}')).collect())
    } else {
        Cow::Borrowed(s)
    }
}

fn sanitize_record(record: &MessageRecord) -> Cow<'_, MessageRecord> {
    let dirty = [
        record.message_id.as_str(),
        record.subject.as_str(),
        record.raw_subject.as_str(),
        record.body.as_str(),
        record.from.display_name.as_str(),
        record.from.address.as_str(),
    ]
    .into_iter()
    .chain(record.in_reply_to.as_deref())
    .chain(record.references.iter().map(String::as_str))
    .any(|s| matches!(sanitize_text(s), Cow::Owned(_)));

    if !dirty {
        return Cow::Borrowed(record);
    }

    let clean = |s: &str| sanitize_text(s).into_owned();
    let mut owned = record.clone();
    owned.message_id = clean(&record.message_id);
    owned.subject = clean(&record.subject);
    owned.raw_subject = clean(&record.raw_subject);
    owned.body = clean(&record.body);
    owned.from.display_name = clean(&record.from.display_name);
    owned.from.address = clean(&record.from.address);
    owned.in_reply_to = record.in_reply_to.as_deref().map(clean);
    owned.references = record.references.iter().map(|r| clean(r)).collect();
    Cow::Owned(owned)
}
