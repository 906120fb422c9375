//! Shared progress state for ingestion runs.
//!
//! One [`SyncTracker`] is owned by the ingestion service and shared with
//! pollers through an `Arc`. Only the active run writes to it.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time copy of the tracker state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncProgress {
    pub months_total: usize,
    pub months_done: usize,
    /// Label of the unit being processed (`2024-01`, or a file name for imports).
    pub current_unit: Option<String>,
    pub is_running: bool,
    /// Newest message date seen in the store.
    pub latest_message_at: Option<DateTime<Utc>>,
    /// When the last run finished.
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncProgress {
    /// Completed fraction in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.months_total == 0 {
            0.0
        } else {
            (self.months_done as f64 / self.months_total as f64).min(1.0)
        }
    }
}

/// Mutex-guarded progress state plus the single-run guard.
#[derive(Debug, Default)]
pub struct SyncTracker {
    state: Mutex<SyncProgress>,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> SyncProgress {
        self.lock().clone()
    }

    /// Mark a run as started, unless one is already active.
    ///
    /// The returned guard clears `is_running` and stamps `last_synced_at`
    /// when dropped, including during a panic unwind.
    pub fn try_begin(self: &Arc<Self>) -> Option<RunGuard> {
        let mut state = self.lock();
        if state.is_running {
            return None;
        }
        state.is_running = true;
        state.months_total = 0;
        state.months_done = 0;
        state.current_unit = None;
        Some(RunGuard {
            tracker: Arc::clone(self),
        })
    }

    pub fn set_total(&self, months_total: usize) {
        self.lock().months_total = months_total;
    }

    pub fn set_current(&self, unit: impl Into<String>) {
        self.lock().current_unit = Some(unit.into());
    }

    /// Count one more unit as done.
    pub fn advance(&self) {
        self.lock().months_done += 1;
    }

    pub fn set_latest_message_at(&self, latest: Option<DateTime<Utc>>) {
        self.lock().latest_message_at = latest;
    }

    /// A poisoned lock still holds consistent plain data; keep using it.
    fn lock(&self) -> MutexGuard<'_, SyncProgress> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Proof that the holder owns the current run.
#[derive(Debug)]
pub struct RunGuard {
    tracker: Arc<SyncTracker>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut state = self.tracker.lock();
        state.is_running = false;
        state.current_unit = None;
        state.last_synced_at = Some(Utc::now());
    }
}
