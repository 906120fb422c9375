//! MBOX archive parser.
//!
//! Scans one archive unit line by line, splits it into messages on `From `
//! separators and turns each message into a validated [`MessageRecord`].
//! Tolerant of malformed input: bad messages are counted, never fatal.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::Datelike;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::model::message::MessageRecord;
use crate::parser::header::{self, MessageIdDefect};
use crate::parser::{mime, patch};

/// Messages dated before this year are rejected as implausible.
pub const MIN_PLAUSIBLE_YEAR: i32 = 1990;

/// Default maximum message size in bytes (64 MB); larger bodies are truncated.
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Per-unit parse counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    /// Messages delimited in the input.
    pub total: usize,
    /// Messages that passed validation.
    pub parsed: usize,
    /// Messages rejected by validation (sum of the three reasons below).
    pub skipped: usize,
    pub invalid_message_id: usize,
    pub invalid_from: usize,
    pub invalid_date: usize,
    /// Kept messages whose id was replaced by a synthesized one.
    pub malformed_message_id: usize,
    /// Kept messages flagged as carrying a patch.
    pub patches: usize,
}

impl ParseStats {
    /// Add another unit's counters to these.
    pub fn merge(&mut self, other: &ParseStats) {
        self.total += other.total;
        self.parsed += other.parsed;
        self.skipped += other.skipped;
        self.invalid_message_id += other.invalid_message_id;
        self.invalid_from += other.invalid_from;
        self.invalid_date += other.invalid_date;
        self.malformed_message_id += other.malformed_message_id;
        self.patches += other.patches;
    }

    fn record_skip(&mut self, reason: SkipReason) {
        self.skipped += 1;
        match reason {
            SkipReason::InvalidMessageId => self.invalid_message_id += 1,
            SkipReason::InvalidFrom => self.invalid_from += 1,
            SkipReason::InvalidDate => self.invalid_date += 1,
        }
    }
}

/// Why a message failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InvalidMessageId,
    InvalidFrom,
    InvalidDate,
}

/// Result of parsing one archive unit.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    /// Valid messages in archive order.
    pub messages: Vec<MessageRecord>,
    pub stats: ParseStats,
}

/// MBOX parser bound to one local archive file.
pub struct MboxParser {
    path: PathBuf,
    file_size: u64,
}

impl MboxParser {
    /// Create a parser for the given MBOX file.
    ///
    /// Verifies that the file exists and is readable, but does NOT validate
    /// that it is actually an MBOX.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SyncError::FileNotFound(path.clone())
            } else {
                SyncError::io(&path, e)
            }
        })?;
        Ok(Self {
            path,
            file_size: metadata.len(),
        })
    }

    /// Memory-map the file and parse it.
    pub fn parse(&self) -> Result<ParseOutcome> {
        if self.file_size == 0 {
            return Ok(ParseOutcome::default());
        }

        let file = File::open(&self.path).map_err(|e| SyncError::io(&self.path, e))?;
        // SAFETY: the archive is opened read-only and not modified while mapped.
        let mmap =
            unsafe { memmap2::Mmap::map(&file) }.map_err(|e| SyncError::io(&self.path, e))?;

        let outcome = parse_bytes(&mmap);
        debug!(
            path = %self.path.display(),
            total = outcome.stats.total,
            parsed = outcome.stats.parsed,
            skipped = outcome.stats.skipped,
            "Parsed archive file"
        );
        Ok(outcome)
    }
}

/// Parse a local archive file.
pub fn parse_file(path: impl AsRef<Path>) -> Result<ParseOutcome> {
    MboxParser::new(path)?.parse()
}

/// Parse the full contents of one archive unit.
pub fn parse_bytes(data: &[u8]) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    split_messages(data, &mut |raw| {
        outcome.stats.total += 1;
        match build_record(raw, &mut outcome.stats) {
            Ok(record) => {
                if record.has_patch {
                    outcome.stats.patches += 1;
                }
                outcome.stats.parsed += 1;
                outcome.messages.push(record);
            }
            Err(reason) => outcome.stats.record_skip(reason),
        }
    });
    outcome
}

/// Split an MBOX byte stream into raw messages (separator line excluded).
///
/// Lines before the first separator are ignored.
fn split_messages(data: &[u8], on_message: &mut dyn FnMut(&[u8])) {
    let mut message_start: Option<usize> = None;
    let mut offset = 0;
    let mut prev_line_was_empty = true;

    while offset < data.len() {
        let line_len =
            memchr_newline(&data[offset..]).map_or(data.len() - offset, |pos| pos + 1);
        let line = &data[offset..offset + line_len];

        if is_mbox_separator(line) {
            if !prev_line_was_empty {
                warn!(offset, "Found 'From ' separator without preceding blank line");
            }
            if let Some(start) = message_start {
                on_message(&data[start..offset]);
            }
            message_start = Some(offset + line_len);
        } else if message_start.is_none() && !is_blank_line(line) {
            debug!(offset, "Skipping text before the first 'From ' separator");
        }

        prev_line_was_empty = is_blank_line(line);
        offset += line_len;
    }

    if let Some(start) = message_start {
        on_message(&data[start.min(data.len())..]);
    }
}

/// Decode and validate one raw message.
///
/// Validation order: message id, sender, date.
fn build_record(
    raw: &[u8],
    stats: &mut ParseStats,
) -> std::result::Result<MessageRecord, SkipReason> {
    let (header_bytes, body_bytes) = split_header_body(raw);
    let fields = header::parse_header_block(header_bytes);

    let Some(raw_id) = fields.message_id.as_deref() else {
        warn!(subject = %fields.subject, "Skipping message without Message-ID");
        return Err(SkipReason::InvalidMessageId);
    };
    let message_id = match header::clean_message_id(raw_id) {
        Ok(id) => id,
        Err(defect) => {
            let generated = header::generate_fallback_id();
            warn!(
                raw = raw_id,
                reason = match defect {
                    MessageIdDefect::Empty => "empty",
                    MessageIdDefect::MissingAt => "missing @",
                },
                generated = %generated,
                "Repaired malformed Message-ID"
            );
            stats.malformed_message_id += 1;
            generated
        }
    };

    if fields.from.is_empty() {
        warn!(message_id = %message_id, "Skipping message without From header");
        return Err(SkipReason::InvalidFrom);
    }

    let date = match fields.date {
        Some(date) if date.year() >= MIN_PLAUSIBLE_YEAR => date,
        other => {
            warn!(message_id = %message_id, date = ?other, "Skipping message with invalid date");
            return Err(SkipReason::InvalidDate);
        }
    };

    let body_bytes = if body_bytes.len() > MAX_MESSAGE_SIZE {
        warn!(
            message_id = %message_id,
            max_size = MAX_MESSAGE_SIZE,
            "Message exceeds maximum size, truncating body"
        );
        &body_bytes[..MAX_MESSAGE_SIZE]
    } else {
        body_bytes
    };
    let body = mime::decode_body(body_bytes, &fields.content_type, &fields.transfer_encoding);

    let subject = header::normalize_subject(&fields.subject);
    let has_patch = body.patch_attachment || patch::detect_patch(&body.text, &fields.subject);
    let patch_status = has_patch.then(|| patch::detect_patch_status(&body.text, &fields.subject));

    Ok(MessageRecord {
        in_reply_to: fields.in_reply_to.filter(|id| *id != message_id),
        references: fields.references,
        message_id,
        raw_subject: fields.subject,
        subject,
        from: fields.from,
        date,
        body: body.text,
        transfer_encoding: fields.transfer_encoding,
        has_patch,
        patch_status,
    })
}

/// Split a raw message at its first blank line.
fn split_header_body(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut offset = 0;
    for line in raw.split_inclusive(|&b| b == b'\n') {
        if is_blank_line(line) {
            return (&raw[..offset], &raw[offset + line.len()..]);
        }
        offset += line.len();
    }
    (raw, &[])
}

/// Fast newline search (equivalent to memchr for `\n`).
#[inline]
fn memchr_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

/// Check whether a line is an MBOX separator (`From ` at the start).
fn is_mbox_separator(line: &[u8]) -> bool {
    line.strip_prefix(&[0xEF, 0xBB, 0xBF])
        .unwrap_or(line)
        .starts_with(b"From ")
}

/// Check whether a line is blank (empty or only whitespace / CR / LF).
fn is_blank_line(line: &[u8]) -> bool {
    line.iter()
        .all(|&b| b == b'\n' || b == b'\r' || b == b' ' || b == b'\t')
}

#[cfg(test)]
mod tests {
    use super::*;

    const M1: &str = "From alice@x.org Thu Jan  4 10:00:00 2024\n\
Message-ID: <m1@x>\n\
From: Alice <alice@x.org>\n\
Subject: Add feature X\n\
Date: Thu, 04 Jan 2024 10:00:00 +0000\n\
\n\
Here is an idea.\n\
\n";

    #[test]
    fn test_is_mbox_separator() {
        assert!(is_mbox_separator(
            b"From user@example.com Thu Jan 01 00:00:00 2024\n"
        ));
        assert!(!is_mbox_separator(b"from user@example.com\n")); // lowercase
        assert!(!is_mbox_separator(b">From user@example.com\n")); // escaped
        assert!(!is_mbox_separator(b"Subject: From here\n"));
    }

    #[test]
    fn test_is_mbox_separator_with_bom() {
        let mut line = vec![0xEF, 0xBB, 0xBF];
        line.extend_from_slice(b"From user@example.com Thu Jan 01 00:00:00 2024\n");
        assert!(is_mbox_separator(&line));
    }

    #[test]
    fn test_is_blank_line() {
        assert!(is_blank_line(b"\n"));
        assert!(is_blank_line(b"\r\n"));
        assert!(is_blank_line(b"  \n"));
        assert!(!is_blank_line(b"hello\n"));
    }

    #[test]
    fn test_parse_single_message() {
        let outcome = parse_bytes(M1.as_bytes());
        assert_eq!(outcome.stats.total, 1);
        assert_eq!(outcome.stats.parsed, 1);
        let msg = &outcome.messages[0];
        assert_eq!(msg.message_id, "m1@x");
        assert_eq!(msg.subject, "Add feature X");
        assert_eq!(msg.author_name(), "Alice");
        assert_eq!(msg.author_email(), "alice@x.org");
        assert_eq!(msg.body, "Here is an idea.");
        assert!(!msg.has_patch);
        assert!(msg.patch_status.is_none());
    }

    #[test]
    fn test_crlf_and_preamble() {
        let data = "garbage before\r\n\r\nFrom a Thu Jan  4 10:00:00 2024\r\n\
Message-ID: <c@x>\r\nFrom: c@x.org\r\nDate: Thu, 04 Jan 2024 10:00:00 +0000\r\n\r\nbody\r\n";
        let outcome = parse_bytes(data.as_bytes());
        assert_eq!(outcome.stats.total, 1);
        assert_eq!(outcome.messages[0].body, "body");
        assert_eq!(outcome.messages[0].author_name(), "c@x.org");
    }

    #[test]
    fn test_validation_order_and_counts() {
        let data = format!(
            "{M1}From x\nFrom: a@x\nDate: Thu, 04 Jan 2024 10:00:00 +0000\n\nno id\n\n\
From x\nMessage-ID: <n@x>\nDate: Thu, 04 Jan 2024 10:00:00 +0000\n\nno from\n\n\
From x\nMessage-ID: <d@x>\nFrom: a@x\n\nno date\n\n\
From x\nMessage-ID: <o@x>\nFrom: a@x\nDate: Mon, 01 Jan 1979 00:00:00 +0000\n\nold\n"
        );
        let outcome = parse_bytes(data.as_bytes());
        assert_eq!(outcome.stats.total, 5);
        assert_eq!(outcome.stats.parsed, 1);
        assert_eq!(outcome.stats.skipped, 4);
        assert_eq!(outcome.stats.invalid_message_id, 1);
        assert_eq!(outcome.stats.invalid_from, 1);
        assert_eq!(outcome.stats.invalid_date, 2);
    }

    #[test]
    fn test_malformed_id_is_repaired() {
        let data = "From x\nMessage-ID: abc def\nFrom: a@x\nDate: Thu, 04 Jan 2024 10:00:00 +0000\n\nbody\n";
        let outcome = parse_bytes(data.as_bytes());
        assert_eq!(outcome.stats.parsed, 1);
        assert_eq!(outcome.stats.skipped, 0);
        assert_eq!(outcome.stats.malformed_message_id, 1);
        let id = &outcome.messages[0].message_id;
        assert!(id.starts_with("generated-"));
        assert!(id.ends_with("@mboxsync.local"));
    }

    #[test]
    fn test_patch_flags() {
        let data = "From x\nMessage-ID: <p@x>\nFrom: a@x\nSubject: [PATCH] Speed up x\n\
Date: Thu, 04 Jan 2024 10:00:00 +0000\n\ndiff --git a/x b/x\n";
        let outcome = parse_bytes(data.as_bytes());
        let msg = &outcome.messages[0];
        assert!(msg.has_patch);
        assert_eq!(msg.patch_status, Some(crate::model::message::PatchStatus::Proposed));
        assert_eq!(outcome.stats.patches, 1);
    }

    #[test]
    fn test_self_reply_is_dropped() {
        let data = "From x\nMessage-ID: <s@x>\nIn-Reply-To: <s@x>\nFrom: a@x\n\
Date: Thu, 04 Jan 2024 10:00:00 +0000\n\nloop\n";
        let outcome = parse_bytes(data.as_bytes());
        assert!(outcome.messages[0].in_reply_to.is_none());
    }

    #[test]
    fn test_stats_merge() {
        let mut a = ParseStats {
            total: 2,
            parsed: 1,
            skipped: 1,
            invalid_date: 1,
            ..Default::default()
        };
        let copy = a;
        a.merge(&copy);
        assert_eq!(a.total, 4);
        assert_eq!(a.invalid_date, 2);
    }

    #[test]
    fn test_empty_input() {
        let outcome = parse_bytes(b"");
        assert_eq!(outcome.stats, ParseStats::default());
        assert!(outcome.messages.is_empty());
    }
}
