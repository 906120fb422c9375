//! Thread activity classification.
//!
//! [`classify`] is a pure function of a thread's aggregates; the keyword
//! scan that feeds it is kept separate so both can be tested in isolation.

use chrono::{DateTime, Utc};

use crate::model::thread::ThreadStatus;

/// A thread is in progress once it has a patch and more than this many messages.
const ACTIVE_PATCH_MESSAGES: u32 = 3;
/// Days of silence before a thread counts as stalled.
const STALLED_AFTER_DAYS: f64 = 7.0;
/// Days of silence before a small thread counts as abandoned.
const ABANDONED_AFTER_DAYS: f64 = 30.0;
/// Threads with fewer messages than this can be abandoned.
const ABANDONED_MAX_MESSAGES: u32 = 5;

/// How a keyword is matched against lowercased text.
#[derive(Debug, Clone, Copy)]
enum Match {
    /// Anywhere, including inside longer words.
    Substring(&'static str),
    /// Bounded by non-alphanumeric characters on both sides.
    Word(&'static str),
}

/// Indicators that a thread carries patch work.
const PATCH_KEYWORDS: [Match; 4] = [
    Match::Substring("patch"),
    Match::Substring("diff"),
    Match::Substring("commit"),
    Match::Word("pr"),
];

/// Indicators that someone reviewed the work.
const REVIEW_KEYWORDS: [Match; 6] = [
    Match::Substring("review"),
    Match::Substring("lgtm"),
    Match::Substring("approved"),
    Match::Substring("looks good"),
    Match::Substring("acked-by"),
    Match::Word("ack"),
];

/// Aggregates the classifier decides on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreadFeatures {
    pub has_patch: bool,
    pub has_review: bool,
    pub message_count: u32,
    /// Fractional days since the newest message.
    pub days_since_last_activity: f64,
}

/// Result of scanning a thread's bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeywordHits {
    pub has_patch: bool,
    pub has_review: bool,
}

/// Map thread aggregates to a status.
///
/// Rules apply in order; the first that holds wins:
/// 1. patch with a review or more than 3 messages → in-progress
/// 2. silent for more than 30 days with fewer than 5 messages → abandoned
/// 3. silent for more than 7 days → stalled
/// 4. otherwise → discussion
pub fn classify(features: &ThreadFeatures) -> ThreadStatus {
    if features.has_patch
        && (features.has_review || features.message_count > ACTIVE_PATCH_MESSAGES)
    {
        ThreadStatus::InProgress
    } else if features.days_since_last_activity > ABANDONED_AFTER_DAYS
        && features.message_count < ABANDONED_MAX_MESSAGES
    {
        ThreadStatus::Abandoned
    } else if features.days_since_last_activity > STALLED_AFTER_DAYS {
        ThreadStatus::Stalled
    } else {
        ThreadStatus::Discussion
    }
}

/// Scan message bodies for patch and review indicators.
pub fn scan_keywords<'a>(bodies: impl IntoIterator<Item = &'a str>) -> KeywordHits {
    let mut hits = KeywordHits::default();
    for body in bodies {
        let lower = body.to_lowercase();
        hits.has_patch |= PATCH_KEYWORDS.iter().any(|k| matches(&lower, *k));
        hits.has_review |= REVIEW_KEYWORDS.iter().any(|k| matches(&lower, *k));
        if hits.has_patch && hits.has_review {
            break;
        }
    }
    hits
}

/// Fractional days from `last` to `now`; never negative.
pub fn days_since(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    match last {
        Some(last) => ((now - last).num_seconds().max(0) as f64) / 86_400.0,
        None => 0.0,
    }
}

fn matches(haystack: &str, keyword: Match) -> bool {
    match keyword {
        Match::Substring(needle) => haystack.contains(needle),
        Match::Word(word) => contains_word(haystack, word),
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.match_indices(word).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + word.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
