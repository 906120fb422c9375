//! RFC 5322 header parsing: folding, encoded-words (RFC 2047), ids and dates.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

use crate::model::address::EmailAddress;
use crate::model::message::TransferEncoding;

/// Header fields the ingestion pipeline cares about, decoded but not yet validated.
#[derive(Debug, Clone, Default)]
pub struct HeaderFields {
    /// Raw `Message-ID` value; `None` when the header is absent.
    pub message_id: Option<String>,
    /// Cleaned `In-Reply-To` id (dropped when malformed).
    pub in_reply_to: Option<String>,
    /// Cleaned `References` ids, in header order.
    pub references: Vec<String>,
    /// Decoded subject.
    pub subject: String,
    pub from: EmailAddress,
    /// `None` when absent or unparseable.
    pub date: Option<DateTime<Utc>>,
    /// Full `Content-Type` value, parameters included.
    pub content_type: String,
    pub transfer_encoding: TransferEncoding,
}

/// Why a `Message-ID` value could not be used as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageIdDefect {
    /// Nothing left after stripping brackets and whitespace.
    Empty,
    /// No `@` in the cleaned value.
    MissingAt,
}

/// Decode a raw header block (everything before the first blank line) into [`HeaderFields`].
pub fn parse_header_block(raw_headers: &[u8]) -> HeaderFields {
    let text = decode_header_bytes(raw_headers);
    let headers = unfold_headers(&text);

    let date = get_header(&headers, "date").and_then(|d| parse_date(&d));

    let from = get_header(&headers, "from")
        .map(|f| EmailAddress::parse(&decode_encoded_words(&f)))
        .unwrap_or_default();

    let subject = get_header(&headers, "subject")
        .map(|s| decode_encoded_words(&s))
        .unwrap_or_default();

    let in_reply_to = get_header(&headers, "in-reply-to")
        .and_then(|v| first_id_token(&v))
        .and_then(|v| clean_message_id(&v).ok());

    let references = get_header(&headers, "references")
        .map(|v| parse_references(&v))
        .unwrap_or_default();

    HeaderFields {
        message_id: get_header(&headers, "message-id"),
        in_reply_to,
        references,
        subject,
        from,
        date,
        content_type: get_header(&headers, "content-type").unwrap_or_default(),
        transfer_encoding: get_header(&headers, "content-transfer-encoding")
            .map(|v| TransferEncoding::from_header(&v))
            .unwrap_or_default(),
    }
}

/// Decode raw header bytes to a string.
///
/// Tries UTF-8 first, then falls back to Windows-1252 (which accepts every byte).
pub fn decode_header_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);

    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Unfold headers: join continuation lines (starting with space or tab) with the previous header.
///
/// Returns a list of `(lowercase_name, raw_value)` pairs.
pub fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                if !last.1.is_empty() {
                    last.1.push(' ');
                }
                last.1.push_str(line.trim());
            }
        } else if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim().to_lowercase();
            let value = line[colon_pos + 1..].trim().to_string();
            result.push((name, value));
        }
        // Lines without a colon and not a continuation are silently skipped
    }

    result
}

/// Get the first value for a header name (names are already lowercase).
pub fn get_header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

/// Clean a `Message-ID` / `In-Reply-To` value.
///
/// Takes the content of the first `<…>` pair when present, otherwise the
/// whole value; then strips stray brackets and every internal space or tab.
pub fn clean_message_id(raw: &str) -> Result<String, MessageIdDefect> {
    let trimmed = raw.trim();
    let inner = trimmed
        .find('<')
        .and_then(|start| {
            trimmed[start..]
                .find('>')
                .map(|end| &trimmed[start + 1..start + end])
        })
        .unwrap_or(trimmed);

    let cleaned: String = inner
        .trim_matches(|c| c == '<' || c == '>')
        .chars()
        .filter(|c| *c != ' ' && *c != '\t')
        .collect();

    if cleaned.is_empty() {
        return Err(MessageIdDefect::Empty);
    }
    if !cleaned.contains('@') {
        return Err(MessageIdDefect::MissingAt);
    }
    Ok(cleaned)
}

/// Synthesize a globally unique id for a message whose own id is malformed.
pub fn generate_fallback_id() -> String {
    format!("generated-{}@mboxsync.local", uuid::Uuid::new_v4())
}

/// Split a `References` value into cleaned ids, keeping header order.
///
/// Angle-bracketed tokens are preferred; when there are none, whitespace
/// separated tokens are used. Malformed ids are dropped.
pub fn parse_references(value: &str) -> Vec<String> {
    let bracketed = extract_all_angle_brackets(value);
    let tokens: Vec<String> = if bracketed.is_empty() {
        value.split_whitespace().map(String::from).collect()
    } else {
        bracketed
    };

    let mut result: Vec<String> = Vec::with_capacity(tokens.len());
    for token in tokens {
        if let Ok(id) = clean_message_id(&token) {
            if !result.contains(&id) {
                result.push(id);
            }
        }
    }
    result
}

/// First id-looking token of an `In-Reply-To` value.
///
/// Some clients append free text (`<id> (Tom Lane's message of ...)`); only the
/// bracketed part is kept when there is one.
fn first_id_token(value: &str) -> Option<String> {
    extract_all_angle_brackets(value)
        .into_iter()
        .next()
        .or_else(|| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
}

/// Extract all `<…>` tokens from a string (for References header).
fn extract_all_angle_brackets(s: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut remaining = s;
    while let Some(start) = remaining.find('<') {
        if let Some(end) = remaining[start..].find('>') {
            result.push(remaining[start..start + end + 1].to_string());
            remaining = &remaining[start + end + 1..];
        } else {
            break;
        }
    }
    result
}

/// Strip leading reply/forward prefixes, repeatedly.
///
/// `"Re: RE: Fwd: Add feature X"` → `"Add feature X"`.
pub fn normalize_subject(subject: &str) -> String {
    const PREFIXES: [&str; 4] = ["re:", "fwd:", "fw:", "aw:"];

    let mut s = subject.trim();
    while let Some(prefix) = PREFIXES.iter().find(|p| {
        s.get(..p.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(p))
    }) {
        s = s[prefix.len()..].trim_start();
    }
    s.trim().to_string()
}

/// Decode RFC 2047 encoded-words in a header value.
///
/// Example: `"=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?="` → `"Hola mundo"`
///
/// If decoding fails for any token, the original text is preserved.
pub fn decode_encoded_words(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut remaining = input;
    let mut last_was_encoded = false;

    while let Some(start) = remaining.find("=?") {
        let before = &remaining[..start];
        // Whitespace between two encoded words is dropped (RFC 2047 §6.2)
        if !last_was_encoded || !before.trim().is_empty() {
            result.push_str(before);
        }

        let after_start = &remaining[start + 2..];

        if let Some(decoded) = try_decode_one_word(after_start) {
            result.push_str(&decoded.text);
            remaining = &remaining[start + 2 + decoded.consumed..];
            last_was_encoded = true;
        } else {
            result.push_str("=?");
            remaining = after_start;
            last_was_encoded = false;
        }
    }

    result.push_str(remaining);
    result
}

struct DecodedWord {
    text: String,
    consumed: usize, // bytes consumed from the string *after* the initial "=?"
}

fn try_decode_one_word(s: &str) -> Option<DecodedWord> {
    // Format: charset?encoding?encoded_text?=
    let first_q = s.find('?')?;
    let charset = &s[..first_q];

    let rest = &s[first_q + 1..];
    let second_q = rest.find('?')?;
    let encoding = &rest[..second_q];

    let rest2 = &rest[second_q + 1..];
    let end = rest2.find("?=")?;
    let encoded_text = &rest2[..end];

    let total_consumed = first_q + 1 + second_q + 1 + end + 2;

    let bytes = match encoding.to_uppercase().as_str() {
        "B" => decode_base64(encoded_text.as_bytes())?,
        "Q" => decode_q_encoding(encoded_text),
        _ => return None,
    };

    Some(DecodedWord {
        text: decode_charset(charset, &bytes),
        consumed: total_consumed,
    })
}

/// Base64 decoder shared by encoded-words and message bodies.
///
/// Whitespace is skipped and missing trailing padding is tolerated. Padding
/// closes the current quad and decoding resumes after it, so bodies whose
/// lines are padded one by one decode in full. Returns `None` when a
/// character outside the base64 alphabet appears.
pub fn decode_base64(input: &[u8]) -> Option<Vec<u8>> {
    fn b64val(c: u8) -> Option<u8> {
        match c {
            b'A'..=b'Z' => Some(c - b'A'),
            b'a'..=b'z' => Some(c - b'a' + 26),
            b'0'..=b'9' => Some(c - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let mut out = Vec::with_capacity(input.len() / 4 * 3);
    let mut quad = [0u8; 4];
    let mut qi = 0;

    for &b in input {
        match b {
            b' ' | b'\n' | b'\r' | b'\t' => continue,
            b'=' => {
                flush_partial(&quad, qi, &mut out)?;
                qi = 0;
            }
            _ => {
                quad[qi] = b64val(b)?;
                qi += 1;
                if qi == 4 {
                    out.push((quad[0] << 2) | (quad[1] >> 4));
                    out.push((quad[1] << 4) | (quad[2] >> 2));
                    out.push((quad[2] << 6) | quad[3]);
                    qi = 0;
                }
            }
        }
    }

    // Trailing partial quad with missing padding
    flush_partial(&quad, qi, &mut out)?;
    Some(out)
}

/// Emit the bytes of a quad cut short by padding or end of input.
fn flush_partial(quad: &[u8; 4], filled: usize, out: &mut Vec<u8>) -> Option<()> {
    match filled {
        0 => {}
        2 => out.push((quad[0] << 2) | (quad[1] >> 4)),
        3 => {
            out.push((quad[0] << 2) | (quad[1] >> 4));
            out.push((quad[1] << 4) | (quad[2] >> 2));
        }
        _ => return None,
    }
    Some(())
}

/// Decode Q-encoding (RFC 2047): underscores → spaces, `=XX` → byte.
fn decode_q_encoding(input: &str) -> Vec<u8> {
    let mut result = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                result.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < bytes.len() => {
                match hex_byte(bytes[i + 1], bytes[i + 2]) {
                    Some(byte) => {
                        result.push(byte);
                        i += 3;
                    }
                    None => {
                        result.push(b'=');
                        i += 1;
                    }
                }
            }
            b => {
                result.push(b);
                i += 1;
            }
        }
    }
    result
}

/// Parse two ASCII hex digits into a byte.
pub(crate) fn hex_byte(hi: u8, lo: u8) -> Option<u8> {
    let digit = |c: u8| (c as char).to_digit(16).map(|d| d as u8);
    Some(digit(hi)? << 4 | digit(lo)?)
}

/// Decode bytes using a named charset.
pub fn decode_charset(charset: &str, bytes: &[u8]) -> String {
    let charset_lower = charset.trim().to_lowercase();
    match charset_lower.as_str() {
        "utf-8" | "utf8" | "us-ascii" | "" => String::from_utf8_lossy(bytes).into_owned(),
        _ => {
            if let Some(encoding) = encoding_rs::Encoding::for_label(charset_lower.as_bytes()) {
                let (decoded, _, _) = encoding.decode(bytes);
                decoded.into_owned()
            } else {
                warn!(
                    charset = charset,
                    "Unknown charset, falling back to UTF-8 lossy"
                );
                String::from_utf8_lossy(bytes).into_owned()
            }
        }
    }
}

/// Parse an email date string in various common formats.
///
/// Supports RFC 2822, ISO 8601, and many broken real-world variants.
/// Returns `None` rather than guessing when nothing matches.
pub fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    let trimmed = strip_trailing_comment(date_str.trim());
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    let no_dow = strip_day_of_week(trimmed);

    const FORMATS: [&str; 8] = [
        "%d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M %z",
        "%d %b %Y %H:%M:%S",
        "%b %d %H:%M:%S %Y",
        "%Y-%m-%dT%H:%M:%S%z",
        "%Y-%m-%d %H:%M:%S %z",
        "%Y-%m-%d %H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
    ];

    for candidate in [no_dow.clone(), replace_named_tz(&no_dow)] {
        for fmt in &FORMATS {
            if let Ok(dt) = DateTime::parse_from_str(&candidate, fmt) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(ndt) = NaiveDateTime::parse_from_str(&candidate, fmt) {
                return Some(Utc.from_utc_datetime(&ndt));
            }
        }
    }

    if let Some(dt) = mail_parser_date(trimmed) {
        return Some(dt);
    }

    warn!(date = trimmed, "Could not parse date");
    None
}

/// Attempt to parse a date using `mail-parser`'s built-in parser.
fn mail_parser_date(input: &str) -> Option<DateTime<Utc>> {
    use mail_parser::MessageParser;

    // Wrap input in a minimal RFC 5322 message so mail-parser can parse it
    let fake_msg = format!("Date: {input}\n\n");
    let parsed = MessageParser::default().parse(fake_msg.as_bytes())?;
    let dt = parsed.date()?.to_rfc3339();
    DateTime::parse_from_rfc3339(&dt)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Drop a trailing `(PST)`-style comment.
fn strip_trailing_comment(s: &str) -> &str {
    match (s.rfind('('), s.ends_with(')')) {
        (Some(pos), true) => s[..pos].trim_end(),
        _ => s,
    }
}

/// Strip leading day-of-week prefix (e.g. "Thu, " or "Thu ").
fn strip_day_of_week(s: &str) -> String {
    const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    for day in DAYS {
        if let Some(rest) = s.strip_prefix(day) {
            if rest.starts_with(',') || rest.starts_with(' ') {
                return rest.trim_start_matches(',').trim().to_string();
            }
        }
    }
    s.to_string()
}

/// Replace well-known timezone abbreviations with numeric offsets.
fn replace_named_tz(s: &str) -> String {
    const TZS: [(&str, &str); 13] = [
        ("EST", "-0500"),
        ("EDT", "-0400"),
        ("CST", "-0600"),
        ("CDT", "-0500"),
        ("MST", "-0700"),
        ("MDT", "-0600"),
        ("PST", "-0800"),
        ("PDT", "-0700"),
        ("GMT", "+0000"),
        ("UTC", "+0000"),
        ("CEST", "+0200"),
        ("CET", "+0100"),
        ("JST", "+0900"),
    ];
    let mut result = s.to_string();
    for (name, offset) in &TZS {
        if result.ends_with(name) {
            let pos = result.len() - name.len();
            result.replace_range(pos.., offset);
            return result;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_encoded_word() {
        let input = "=?UTF-8?B?SG9sYSBtdW5kbw==?=";
        assert_eq!(decode_encoded_words(input), "Hola mundo");
    }

    #[test]
    fn test_decode_q_encoded_word() {
        let input = "=?ISO-8859-1?Q?caf=E9?=";
        assert_eq!(decode_encoded_words(input), "café");
    }

    #[test]
    fn test_decode_multiple_encoded_words() {
        let input = "=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?=";
        assert_eq!(decode_encoded_words(input), "Hola mundo");
    }

    #[test]
    fn test_decode_windows1252_encoded_word() {
        assert_eq!(decode_encoded_words("=?Windows-1252?Q?M=FCller?="), "Müller");
    }

    #[test]
    fn test_decode_base64_unpadded_and_invalid() {
        assert_eq!(decode_base64(b"SGk").as_deref(), Some(&b"Hi"[..]));
        assert_eq!(decode_base64(b"SGk=\n").as_deref(), Some(&b"Hi"[..]));
        assert!(decode_base64(b"not base64!").is_none());
    }

    #[test]
    fn test_decode_base64_padded_per_line() {
        assert_eq!(
            decode_base64(b"SGk=\nIHRoZXJl\n").as_deref(),
            Some(&b"Hi there"[..])
        );
        assert_eq!(decode_base64(b"SQ==\nSGk=\n").as_deref(), Some(&b"IHi"[..]));
        // A lone sextet before padding cannot form a byte
        assert!(decode_base64(b"SGk=S=").is_none());
    }

    #[test]
    fn test_unfold_headers() {
        let text = "Subject: This is a long\n\tsubject line\nFrom: user@example.com\n";
        let headers = unfold_headers(text);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].0, "subject");
        assert_eq!(headers[0].1, "This is a long subject line");
    }

    #[test]
    fn test_clean_message_id() {
        assert_eq!(
            clean_message_id(" <abc@example.com> "),
            Ok("abc@example.com".to_string())
        );
        assert_eq!(
            clean_message_id("<abc @example .com>"),
            Ok("abc@example.com".to_string())
        );
        assert_eq!(clean_message_id("abc def"), Err(MessageIdDefect::MissingAt));
        assert_eq!(clean_message_id("<>"), Err(MessageIdDefect::Empty));
    }

    #[test]
    fn test_generate_fallback_id_is_unique() {
        let a = generate_fallback_id();
        let b = generate_fallback_id();
        assert_ne!(a, b);
        assert!(a.contains('@'));
        assert!(clean_message_id(&a).is_ok());
    }

    #[test]
    fn test_parse_references_keeps_order() {
        let refs = parse_references("<a@x> <b@x>\n <c@x> <a@x> <junk>");
        assert_eq!(refs, vec!["a@x", "b@x", "c@x"]);
        assert_eq!(parse_references("a@x b@x"), vec!["a@x", "b@x"]);
    }

    #[test]
    fn test_normalize_subject() {
        assert_eq!(normalize_subject("Add feature X"), "Add feature X");
        assert_eq!(normalize_subject("Re: Add feature X"), "Add feature X");
        assert_eq!(normalize_subject("RE: Re: Fwd: Add feature X"), "Add feature X");
        assert_eq!(normalize_subject("FW:Re:  Topic"), "Topic");
        assert_eq!(normalize_subject("Reindex speedup"), "Reindex speedup");
    }

    #[test]
    fn test_parse_date_rfc2822() {
        let dt = parse_date("Thu, 04 Jan 2024 10:00:00 +0000").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2024-01-04");
    }

    #[test]
    fn test_parse_date_single_digit_day() {
        let dt = parse_date("Mon, 2 Jan 2006 15:04:05 -0700").unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M").to_string(), "2006-01-02 22:04");
    }

    #[test]
    fn test_parse_date_without_dow() {
        assert!(parse_date("04 Jan 2024 10:00:00 +0000").is_some());
    }

    #[test]
    fn test_parse_date_named_tz_and_comment() {
        assert!(parse_date("Thu, 04 Jan 2024 10:00:00 EST").is_some());
        assert!(parse_date("Thu, 04 Jan 2024 10:00:00 -0800 (PST)").is_some());
    }

    #[test]
    fn test_parse_date_garbage_is_none() {
        assert!(parse_date("").is_none());
        assert!(parse_date("sometime last week").is_none());
    }

    #[test]
    fn test_parse_header_block() {
        let raw = b"Message-ID: <m2@x>\n\
In-Reply-To: <m1@x> (message from Alice)\n\
References: <m0@x>\n <m1@x>\n\
Subject: Re: =?UTF-8?Q?caf=C3=A9?=\n\
From: Bob <bob@x.org>\n\
Date: Thu, 04 Jan 2024 10:00:00 +0000\n\
Content-Type: text/plain; charset=utf-8\n\
Content-Transfer-Encoding: quoted-printable\n";
        let fields = parse_header_block(raw);
        assert_eq!(fields.message_id.as_deref(), Some("<m2@x>"));
        assert_eq!(fields.in_reply_to.as_deref(), Some("m1@x"));
        assert_eq!(fields.references, vec!["m0@x", "m1@x"]);
        assert_eq!(fields.subject, "Re: café");
        assert_eq!(fields.from.address, "bob@x.org");
        assert!(fields.date.is_some());
        assert_eq!(fields.transfer_encoding, TransferEncoding::QuotedPrintable);
    }
}
