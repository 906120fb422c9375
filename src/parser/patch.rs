//! Patch detection heuristics.
//!
//! Both scans are fixed keyword tables over the decoded body and subject.

use crate::model::message::PatchStatus;

/// Subject markers, matched against the lowercased subject.
const SUBJECT_MARKERS: [&str; 4] = ["[patch", "patch v", "v1 patch", "v2 patch"];

/// Unified diff markers, matched case-sensitively against the body.
const DIFF_MARKERS: [&str; 3] = ["diff --git", "--- a/", "+++ b/"];

/// Attachment markers, matched against the lowercased body.
const ATTACHMENT_MARKERS: [&str; 4] = [
    "attached patch",
    "patch attached",
    ".patch",
    "content-disposition: attachment",
];

/// Status groups, checked in order; the first hit wins.
const STATUS_RULES: [(PatchStatus, &[&str]); 3] = [
    (PatchStatus::Committed, &["committed", "pushed", "applied"]),
    (
        PatchStatus::Accepted,
        &[
            "ready for committer",
            "marked as ready",
            "moved to ready for committer",
        ],
    ),
    (
        PatchStatus::Rejected,
        &["rejected", "not applying", "returned with feedback"],
    ),
];

/// Whether a message carries a patch.
pub fn detect_patch(body: &str, subject: &str) -> bool {
    let subject_lower = subject.to_lowercase();
    if SUBJECT_MARKERS.iter().any(|m| subject_lower.contains(m)) {
        return true;
    }

    if DIFF_MARKERS.iter().any(|m| body.contains(m)) {
        return true;
    }
    // Context diff
    if body.contains("*** ") && body.contains("--- ") {
        return true;
    }

    let body_lower = body.to_lowercase();
    ATTACHMENT_MARKERS.iter().any(|m| body_lower.contains(m))
}

/// Lifecycle hint for a message already known to carry a patch.
///
/// Anything not matching a more specific group (commitfest entries included)
/// is [`PatchStatus::Proposed`].
pub fn detect_patch_status(body: &str, subject: &str) -> PatchStatus {
    let body_lower = body.to_lowercase();
    let subject_lower = subject.to_lowercase();

    STATUS_RULES
        .iter()
        .find(|(status, keywords)| {
            keywords.iter().any(|k| body_lower.contains(k))
                || (*status == PatchStatus::Committed && subject_lower.contains("committed"))
        })
        .map(|(status, _)| *status)
        .unwrap_or(PatchStatus::Proposed)
}
