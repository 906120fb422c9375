//! Thread groups (transient) and thread records (persisted).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::MessageRecord;

/// One conversation found in a single parsed batch.
///
/// Consumed by the reconciler; never persisted directly.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    /// Earliest known ancestor id. May name a message that was never observed.
    pub root_id: String,
    /// Members ordered by date.
    pub members: Vec<MessageRecord>,
}

impl ThreadGroup {
    /// Member with the earliest date (the first one, since members are sorted).
    pub fn earliest(&self) -> Option<&MessageRecord> {
        self.members.iter().min_by_key(|m| m.date)
    }
}

/// Activity status of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadStatus {
    InProgress,
    Discussion,
    Stalled,
    Abandoned,
}

impl ThreadStatus {
    /// Every status, in display order.
    pub const ALL: [ThreadStatus; 4] = [
        ThreadStatus::InProgress,
        ThreadStatus::Discussion,
        ThreadStatus::Stalled,
        ThreadStatus::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Discussion => "discussion",
            Self::Stalled => "stalled",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown thread status '{s}'"))
    }
}

/// A thread as persisted in the store.
///
/// `message_count` and `unique_authors` are always recomputed from the
/// persisted messages; they are never incremented in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadRecord {
    pub id: String,
    pub subject: String,
    /// Root id of the group that created the thread.
    pub first_message_id: String,
    pub first_author: String,
    pub first_author_email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u32,
    pub unique_authors: u32,
    pub status: ThreadStatus,
}

/// Activity snapshot written whenever a thread is reclassified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadActivity {
    pub thread_id: String,
    pub message_count: u32,
    pub unique_authors: u32,
    pub has_patch: bool,
    pub has_review: bool,
    pub days_since_last_message: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_forms() {
        assert_eq!(ThreadStatus::InProgress.as_str(), "in-progress");
        assert_eq!("stalled".parse::<ThreadStatus>(), Ok(ThreadStatus::Stalled));
        assert!("closed".parse::<ThreadStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&ThreadStatus::InProgress).unwrap(),
            "\"in-progress\""
        );
    }
}
