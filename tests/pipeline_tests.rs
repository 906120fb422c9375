//! End-to-end tests: parse, thread and reconcile into an in-memory store.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};

use mboxsync::model::thread::ThreadStatus;
use mboxsync::parser::{parse_bytes, parse_file};
use mboxsync::reconcile::{reconcile_at, ReconcileReport};
use mboxsync::store::Store;
use mboxsync::threading::resolve_threads;

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
}

fn ingest_bytes(store: &mut Store, data: &[u8], now: DateTime<Utc>) -> ReconcileReport {
    let outcome = parse_bytes(data);
    reconcile_at(store, resolve_threads(outcome.messages), now).unwrap()
}

fn ingest_fixture(store: &mut Store, name: &str, now: DateTime<Utc>) -> ReconcileReport {
    let outcome = parse_file(fixture(name)).unwrap();
    reconcile_at(store, resolve_threads(outcome.messages), now).unwrap()
}

const FEATURE_X: &str = "From alice@x Thu Jan  4 10:00:00 2024
Message-ID: <m1@x>
From: Alice <alice@x.org>
Subject: Add feature X
Date: Thu, 04 Jan 2024 10:00:00 +0000

Here is an idea for feature X.

From bob@x Thu Jan  4 11:00:00 2024
Message-ID: <m2@x>
In-Reply-To: <m1@x>
From: Bob <bob@x.org>
Subject: Re: Add feature X
Date: Thu, 04 Jan 2024 11:00:00 +0000

Nice, patch attached. LGTM from my side.
";

// ─── Test 1: Two-message thread is in progress ──────────────────────

#[test]
fn test_reply_with_patch_and_review() {
    let mut store = Store::open_in_memory().unwrap();
    let report = ingest_bytes(&mut store, FEATURE_X.as_bytes(), at(2024, 1, 4, 12));
    assert_eq!(report.inserted, 2);
    assert_eq!(report.threads_created, 1);

    let threads = store.list_threads(None, 10).unwrap();
    assert_eq!(threads.len(), 1);
    let thread = &threads[0];
    assert_eq!(thread.first_message_id, "m1@x");
    assert_eq!(thread.subject, "Add feature X");
    assert_eq!(thread.first_author, "Alice");
    assert_eq!(thread.message_count, 2);
    assert_eq!(thread.unique_authors, 2);
    assert_eq!(thread.last_message_at, Some(at(2024, 1, 4, 11)));
    assert_eq!(thread.status, ThreadStatus::InProgress);

    let activity = store.get_activity(&thread.id).unwrap().unwrap();
    assert!(activity.has_patch);
    assert!(activity.has_review);
    assert_eq!(activity.days_since_last_message, 0);
}

// ─── Test 2: Re-ingesting the same batch changes nothing ────────────

#[test]
fn test_reingest_is_idempotent() {
    let mut store = Store::open_in_memory().unwrap();
    let now = at(2024, 1, 4, 12);
    ingest_bytes(&mut store, FEATURE_X.as_bytes(), now);
    let before = store.list_threads(None, 10).unwrap();

    let report = ingest_bytes(&mut store, FEATURE_X.as_bytes(), now);
    assert_eq!(report.inserted, 0);
    assert_eq!(report.updated, 2);
    assert_eq!(report.threads_created, 0);

    let after = store.list_threads(None, 10).unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].message_count, 2);
    assert_eq!(after[0].status, before[0].status);
    assert_eq!(store.stats().unwrap().messages, 2);
}

// ─── Test 3: Fixture archive ────────────────────────────────────────

#[test]
fn test_fixture_archive() {
    let mut store = Store::open_in_memory().unwrap();
    let report = ingest_fixture(&mut store, "thread.mbox", at(2024, 1, 15, 0));
    assert_eq!(report.groups, 3);
    assert_eq!(report.inserted, 6);
    assert_eq!(report.threads_created, 3);

    let m1 = store.get_message("m1@example.org").unwrap().unwrap();
    let feature = store.get_thread(&m1.thread_id).unwrap().unwrap();
    assert_eq!(feature.subject, "[PATCH v1] Add feature X");
    assert_eq!(feature.first_author, "Alice Liddell");
    assert_eq!(feature.first_author_email, "alice@example.org");
    assert_eq!(feature.message_count, 3);
    assert_eq!(feature.unique_authors, 3);
    assert_eq!(feature.status, ThreadStatus::InProgress);

    let messages = store.thread_messages(&feature.id).unwrap();
    let ids: Vec<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, vec!["m1@example.org", "m2@example.org", "m3@example.org"]);
    assert_eq!(messages[2].references, vec!["m1@example.org", "m2@example.org"]);

    let m4 = store.get_message("m4@example.org").unwrap().unwrap();
    let vacuum = store.get_thread(&m4.thread_id).unwrap().unwrap();
    assert_eq!(vacuum.message_count, 2);
    assert_eq!(vacuum.status, ThreadStatus::Discussion);

    let stats = store.stats().unwrap();
    assert_eq!(stats.threads, 3);
    assert_eq!(stats.messages, 6);
    assert_eq!(stats.patches, 3);
    assert_eq!(stats.latest_message_at, Some(at(2024, 1, 14, 9) + chrono::Duration::minutes(15)));
}

// ─── Test 4: Follow-up month joins persisted threads ────────────────

#[test]
fn test_followup_month() {
    let mut store = Store::open_in_memory().unwrap();
    ingest_fixture(&mut store, "thread.mbox", at(2024, 1, 15, 0));
    let report = ingest_fixture(&mut store, "followup.mbox", at(2024, 2, 6, 0));
    assert_eq!(report.inserted, 2);
    // Only the reply to the never-seen m99 opens a thread
    assert_eq!(report.threads_created, 1);

    let m1 = store.get_message("m1@example.org").unwrap().unwrap();
    let m9 = store.get_message("m9@example.org").unwrap().unwrap();
    assert_eq!(m9.thread_id, m1.thread_id);
    let feature = store.get_thread(&m1.thread_id).unwrap().unwrap();
    assert_eq!(feature.message_count, 4);
    assert_eq!(feature.unique_authors, 3);
    assert_eq!(feature.status, ThreadStatus::InProgress);

    let orphan = store.get_message("m10@example.org").unwrap().unwrap();
    let orphan_thread = store.get_thread(&orphan.thread_id).unwrap().unwrap();
    assert_eq!(orphan_thread.first_message_id, "m99@example.org");
    assert_eq!(orphan_thread.first_author, "Henry");

    // Quiet since mid-January
    let m4 = store.get_message("m4@example.org").unwrap().unwrap();
    let vacuum = store.get_thread(&m4.thread_id).unwrap().unwrap();
    assert_eq!(vacuum.status, ThreadStatus::Stalled);

    let stalled = store.list_threads(Some(ThreadStatus::Stalled), 10).unwrap();
    assert_eq!(stalled.len(), 2);
}

// ─── Test 5: Reset empties the store ────────────────────────────────

#[test]
fn test_reset() {
    let mut store = Store::open_in_memory().unwrap();
    ingest_fixture(&mut store, "thread.mbox", at(2024, 1, 15, 0));
    store.reset().unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.threads, 0);
    assert_eq!(stats.messages, 0);
    assert_eq!(store.latest_message_at().unwrap(), None);

    let report = ingest_fixture(&mut store, "thread.mbox", at(2024, 1, 15, 0));
    assert_eq!(report.inserted, 6);
}

// ─── Test 6: Thread id prefixes ─────────────────────────────────────

#[test]
fn test_resolve_thread_id_prefix() {
    let mut store = Store::open_in_memory().unwrap();
    ingest_bytes(&mut store, FEATURE_X.as_bytes(), at(2024, 1, 4, 12));
    let thread = &store.list_threads(None, 1).unwrap()[0];

    assert_eq!(store.resolve_thread_id(&thread.id[..8]).unwrap(), thread.id);
    assert!(store.resolve_thread_id("zzzz").is_err());
}
