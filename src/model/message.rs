//! Message records produced by the parser and persisted by the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::address::EmailAddress;

/// A validated message extracted from one archive unit.
///
/// Created once by the parser and never mutated afterwards except by
/// UTF-8 sanitization in the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Cleaned `Message-ID` (no angle brackets, no whitespace), or a
    /// synthesized fallback for malformed headers.
    pub message_id: String,

    /// Cleaned `In-Reply-To` id, if present.
    pub in_reply_to: Option<String>,

    /// Cleaned ids from the `References` header, in header order.
    pub references: Vec<String>,

    /// Decoded subject exactly as sent.
    pub raw_subject: String,

    /// Subject with leading `Re:` / `Fwd:` prefixes stripped.
    pub subject: String,

    /// Sender.
    pub from: EmailAddress,

    /// Parsed `Date:` header.
    pub date: DateTime<Utc>,

    /// Decoded body text (text parts only for multipart messages).
    pub body: String,

    /// Top-level `Content-Transfer-Encoding`.
    pub transfer_encoding: TransferEncoding,

    /// Whether the message carries a patch.
    pub has_patch: bool,

    /// Patch lifecycle hint, only set when `has_patch` is true.
    pub patch_status: Option<PatchStatus>,
}

impl MessageRecord {
    /// Author name for storage (display name, falling back to the address).
    pub fn author_name(&self) -> &str {
        self.from.author_name()
    }

    /// Author email address.
    pub fn author_email(&self) -> &str {
        &self.from.address
    }
}

/// A message row as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub thread_id: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub subject: String,
    pub author: String,
    pub author_email: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub has_patch: bool,
    pub patch_status: Option<PatchStatus>,
}

/// `Content-Transfer-Encoding` values the body decoder distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransferEncoding {
    #[default]
    SevenBit,
    EightBit,
    Binary,
    Base64,
    QuotedPrintable,
    /// Anything else; the body passes through undecoded.
    Other(String),
}

impl TransferEncoding {
    /// Interpret a header value (case-insensitive, surrounding whitespace ignored).
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "7bit" => Self::SevenBit,
            "8bit" => Self::EightBit,
            "binary" => Self::Binary,
            "base64" => Self::Base64,
            "quoted-printable" => Self::QuotedPrintable,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::SevenBit => "7bit",
            Self::EightBit => "8bit",
            Self::Binary => "binary",
            Self::Base64 => "base64",
            Self::QuotedPrintable => "quoted-printable",
            Self::Other(s) => s,
        }
    }
}

/// Where a patch appears to be in its review lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchStatus {
    Proposed,
    Committed,
    Accepted,
    Rejected,
}

impl PatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Committed => "committed",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(Self::Proposed),
            "committed" => Ok(Self::Committed),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown patch status '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_encoding_from_header() {
        assert_eq!(TransferEncoding::from_header(" BASE64 "), TransferEncoding::Base64);
        assert_eq!(
            TransferEncoding::from_header("Quoted-Printable"),
            TransferEncoding::QuotedPrintable
        );
        assert_eq!(TransferEncoding::from_header(""), TransferEncoding::SevenBit);
        assert_eq!(
            TransferEncoding::from_header("x-uuencode"),
            TransferEncoding::Other("x-uuencode".to_string())
        );
    }

    #[test]
    fn test_patch_status_parse() {
        for status in [
            PatchStatus::Proposed,
            PatchStatus::Committed,
            PatchStatus::Accepted,
            PatchStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<PatchStatus>(), Ok(status));
        }
        assert!("merged".parse::<PatchStatus>().is_err());
    }
}
