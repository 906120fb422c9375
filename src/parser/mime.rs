//! MIME body decoding: transfer encodings, multipart splitting, HTML-to-text.

use crate::model::message::TransferEncoding;
use crate::parser::header::{
    decode_base64, decode_charset, decode_header_bytes, get_header, hex_byte, unfold_headers,
};

/// Maximum depth for nested multipart descent (adversarial input guard).
const MAX_DEPTH: usize = 10;

/// Separator placed between the text parts of a multipart body.
pub const PART_SEPARATOR: &str = "\n\n---\n\n";

/// A decoded message body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedBody {
    /// Text content, trimmed.
    pub text: String,
    /// A part carried a patch file (`.patch`/`.diff` name or a patch content type).
    pub patch_attachment: bool,
}

/// Decode a message body according to its top-level `Content-Type` and
/// `Content-Transfer-Encoding`.
///
/// Multipart bodies keep their non-attachment text parts joined by
/// [`PART_SEPARATOR`]; when none survive, the raw body is kept.
pub fn decode_body(raw: &[u8], content_type: &str, encoding: &TransferEncoding) -> DecodedBody {
    if mime_type(content_type).starts_with("multipart/") {
        if let Some(boundary) = content_type_param(content_type, "boundary") {
            let mut collected = Collected::default();
            collect_multipart(raw, &boundary, &mime_type(content_type), 0, &mut collected);
            let text = if collected.texts.is_empty() {
                decode_header_bytes(raw).trim().to_string()
            } else {
                collected.texts.join(PART_SEPARATOR)
            };
            return DecodedBody {
                text,
                patch_attachment: collected.patch_attachment,
            };
        }
    }

    DecodedBody {
        text: decode_part(raw, content_type, encoding).trim().to_string(),
        patch_attachment: false,
    }
}

#[derive(Default)]
struct Collected {
    texts: Vec<String>,
    patch_attachment: bool,
}

/// One part of a multipart body: raw headers and raw content.
struct RawPart<'a> {
    headers: Vec<(String, String)>,
    body: &'a [u8],
}

fn collect_multipart(
    raw: &[u8],
    boundary: &str,
    container: &str,
    depth: usize,
    out: &mut Collected,
) {
    let parts = split_parts(raw, boundary);

    // multipart/alternative: one rendering is enough, plain text preferred
    if container == "multipart/alternative" {
        let pick = parts
            .iter()
            .find(|p| part_type(p) == "text/plain")
            .or_else(|| parts.iter().find(|p| part_type(p).starts_with("text/")));
        if let Some(part) = pick {
            push_text(part, out);
        }
        return;
    }

    for part in &parts {
        let ctype = part_type(part);
        let content_type = get_header(&part.headers, "content-type").unwrap_or_default();
        let disposition = get_header(&part.headers, "content-disposition")
            .unwrap_or_default()
            .to_ascii_lowercase();

        if is_patch_part(&ctype, &content_type, &disposition) {
            out.patch_attachment = true;
        }
        if disposition.contains("attachment") {
            continue;
        }

        if ctype.starts_with("multipart/") {
            match content_type_param(&content_type, "boundary") {
                Some(inner) if depth + 1 < MAX_DEPTH => {
                    collect_multipart(part.body, &inner, &ctype, depth + 1, out);
                }
                _ => {}
            }
        } else if ctype.starts_with("text/") {
            push_text(part, out);
        }
    }
}

fn push_text(part: &RawPart<'_>, out: &mut Collected) {
    let content_type = get_header(&part.headers, "content-type").unwrap_or_default();
    let encoding = get_header(&part.headers, "content-transfer-encoding")
        .map(|v| TransferEncoding::from_header(&v))
        .unwrap_or_default();
    let text = decode_part(part.body, &content_type, &encoding);
    let text = text.trim();
    if !text.is_empty() {
        out.texts.push(text.to_string());
    }
}

/// Content type of a part, defaulting to `text/plain` when absent (RFC 2045 §5.2).
fn part_type(part: &RawPart<'_>) -> String {
    get_header(&part.headers, "content-type")
        .map(|ct| mime_type(&ct))
        .unwrap_or_else(|| "text/plain".to_string())
}

fn is_patch_part(ctype: &str, content_type: &str, disposition: &str) -> bool {
    if matches!(ctype, "text/x-patch" | "text/x-diff" | "application/x-patch") {
        return true;
    }
    let filename = content_type_param(disposition, "filename")
        .or_else(|| content_type_param(content_type, "name"))
        .unwrap_or_default()
        .to_ascii_lowercase();
    filename.ends_with(".patch") || filename.ends_with(".diff")
}

/// Split a multipart body into parts on `--boundary` lines.
///
/// The preamble before the first boundary and the epilogue after the
/// closing `--boundary--` are dropped.
fn split_parts<'a>(raw: &'a [u8], boundary: &str) -> Vec<RawPart<'a>> {
    let delimiter = format!("--{boundary}");
    let closing = format!("--{boundary}--");

    let mut parts = Vec::new();
    let mut part_start: Option<usize> = None;
    let mut offset = 0;

    for line in raw.split_inclusive(|&b| b == b'\n') {
        let trimmed = trim_line_end(line);
        if trimmed.starts_with(delimiter.as_bytes()) {
            if let Some(start) = part_start.take() {
                parts.push(split_part(&raw[start..offset]));
            }
            if !trimmed.starts_with(closing.as_bytes()) {
                part_start = Some(offset + line.len());
            }
        }
        offset += line.len();
    }

    // Unterminated final part
    if let Some(start) = part_start {
        parts.push(split_part(&raw[start..]));
    }

    parts
}

/// Separate a part's header block from its content at the first blank line.
fn split_part(data: &[u8]) -> RawPart<'_> {
    let mut offset = 0;
    for line in data.split_inclusive(|&b| b == b'\n') {
        if trim_line_end(line).is_empty() {
            let headers = unfold_headers(&decode_header_bytes(&data[..offset]));
            return RawPart {
                headers,
                body: &data[offset + line.len()..],
            };
        }
        offset += line.len();
    }
    // No blank line: either all headers or all content. Treat as content.
    RawPart {
        headers: Vec::new(),
        body: data,
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Decode a single leaf part: transfer encoding, then charset, then HTML stripping.
fn decode_part(raw: &[u8], content_type: &str, encoding: &TransferEncoding) -> String {
    let bytes = match encoding {
        TransferEncoding::Base64 => decode_base64(raw).unwrap_or_else(|| raw.to_vec()),
        TransferEncoding::QuotedPrintable => decode_quoted_printable(raw),
        _ => raw.to_vec(),
    };

    let text = match content_type_param(content_type, "charset") {
        Some(charset) => decode_charset(&charset, &bytes),
        None => decode_header_bytes(&bytes),
    };

    if mime_type(content_type) == "text/html" {
        html_to_text(&text)
    } else {
        text
    }
}

/// Decode a quoted-printable payload (RFC 2045 §6.7).
///
/// Soft line breaks are removed; malformed escapes are kept literally.
pub fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'=' {
            match input.get(i + 1..i + 3) {
                Some([b'\r', b'\n']) => {
                    i += 3;
                    continue;
                }
                Some([b'\n', _]) => {
                    i += 2;
                    continue;
                }
                Some(&[hi, lo]) => {
                    if let Some(byte) = hex_byte(hi, lo) {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                }
                _ => {
                    // "=" followed by at most one byte: soft break before EOF
                    if input.get(i + 1).is_none_or(|&b| b == b'\n') {
                        i += 2;
                        continue;
                    }
                }
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

/// Lowercase `type/subtype` of a `Content-Type` value, parameters removed.
pub fn mime_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Look up a parameter (`boundary`, `charset`, `filename`, ...) in a
/// structured header value. Names match case-insensitively; quotes are
/// stripped, and a `;` inside a quoted value does not end it.
pub fn content_type_param(value: &str, name: &str) -> Option<String> {
    split_params(value).into_iter().skip(1).find_map(|segment| {
        let (key, val) = segment.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        let val = val.trim().trim_matches('"').trim();
        (!val.is_empty()).then(|| val.to_string())
    })
}

/// Split a header value on `;` outside double quotes.
fn split_params(value: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                segments.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&value[start..]);
    segments
}

/// Convert HTML to plain text.
///
/// - Preserves line breaks from `<br>`, `<p>`, `<div>`
/// - Removes scripts and styles
/// - Decodes common HTML entities
pub fn html_to_text(html: &str) -> String {
    let mut text = remove_tag_block(html, "script");
    text = remove_tag_block(&text, "style");

    for tag in ["br", "br/", "br /", "p", "div", "tr", "li"] {
        for variant in [tag.to_string(), tag.to_uppercase()] {
            text = text.replace(&format!("<{variant}>"), "\n");
            text = text.replace(&format!("</{variant}>"), "\n");
        }
    }

    let mut stripped = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => stripped.push(ch),
            _ => {}
        }
    }

    const ENTITIES: [(&str, &str); 7] = [
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#39;", "'"),
        ("&apos;", "'"),
        ("&nbsp;", " "),
        ("&amp;", "&"),
    ];
    for (entity, replacement) in ENTITIES {
        stripped = stripped.replace(entity, replacement);
    }

    // Collapse runs of blank lines
    let mut cleaned = String::with_capacity(stripped.len());
    let mut prev_was_blank = false;
    for line in stripped.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !prev_was_blank {
                cleaned.push('\n');
                prev_was_blank = true;
            }
        } else {
            cleaned.push_str(trimmed);
            cleaned.push('\n');
            prev_was_blank = false;
        }
    }

    cleaned.trim().to_string()
}

/// Remove an entire tag block (e.g. `<script>…</script>`), case-insensitively.
fn remove_tag_block(html: &str, tag: &str) -> String {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut result = String::with_capacity(html.len());
    let mut remaining = html;

    // ASCII lowercasing keeps byte offsets aligned with the original
    while let Some(start) = remaining.to_ascii_lowercase().find(&open) {
        result.push_str(&remaining[..start]);
        let after = &remaining[start..];
        match after.to_ascii_lowercase().find(&close) {
            Some(end) => remaining = &after[end + close.len()..],
            None => {
                remaining = "";
                break;
            }
        }
    }
    result.push_str(remaining);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multipart(ct: &str, body: &str) -> DecodedBody {
        decode_body(body.as_bytes(), ct, &TransferEncoding::SevenBit)
    }

    #[test]
    fn test_single_part_base64() {
        let body = decode_body(
            b"SGVsbG8sIHdvcmxkIQ==\n",
            "text/plain; charset=utf-8",
            &TransferEncoding::Base64,
        );
        assert_eq!(body.text, "Hello, world!");
    }

    #[test]
    fn test_single_part_invalid_base64_keeps_raw() {
        let body = decode_body(b"this is *not* base64\n", "text/plain", &TransferEncoding::Base64);
        assert_eq!(body.text, "this is *not* base64");
    }

    #[test]
    fn test_single_part_quoted_printable_latin1() {
        let body = decode_body(
            b"caf=E9 cr=\n=E8me\n",
            "text/plain; charset=\"iso-8859-1\"",
            &TransferEncoding::QuotedPrintable,
        );
        assert_eq!(body.text, "café crème");
    }

    #[test]
    fn test_multipart_base64_text_and_attachment() {
        let raw = "preamble\n\
--XYZ\n\
Content-Type: text/plain; charset=utf-8\n\
Content-Transfer-Encoding: base64\n\
\n\
SGVsbG8gZnJvbSBwYXJ0IG9uZQ==\n\
--XYZ\n\
Content-Type: text/x-patch; name=\"fix.patch\"\n\
Content-Disposition: attachment; filename=\"fix.patch\"\n\
\n\
diff --git a/x b/x\n\
--XYZ\n\
Content-Type: text/plain\n\
\n\
Second text part\n\
--XYZ--\n\
epilogue\n";
        let body = multipart("multipart/mixed; boundary=\"XYZ\"", raw);
        assert_eq!(body.text, "Hello from part one\n\n---\n\nSecond text part");
        assert!(body.patch_attachment);
        assert!(!body.text.contains("diff --git"));
    }

    #[test]
    fn test_multipart_base64_utf8_text() {
        let raw = "--=_q;b\n\
Content-Type: text/plain; charset=\"utf-8\"\n\
Content-Transfer-Encoding: base64\n\
\n\
aMOpbGxvIHfDtnJsZCDinJMgbmHDr3Zl\n\
--=_q;b--\n";
        let body = multipart("multipart/mixed; boundary=\"=_q;b\"", raw);
        assert_eq!(body.text, "héllo wörld ✓ naïve");
    }

    #[test]
    fn test_single_part_base64_padded_per_line() {
        let body = decode_body(b"SGk=\nIHRoZXJl\n", "text/plain", &TransferEncoding::Base64);
        assert_eq!(body.text, "Hi there");
    }

    #[test]
    fn test_multipart_without_text_keeps_raw() {
        let raw = "--B\nContent-Type: application/pdf\n\nJVBERi0=\n--B--\n";
        let body = multipart("multipart/mixed; boundary=B", raw);
        assert_eq!(body.text, raw.trim());
    }

    #[test]
    fn test_multipart_alternative_prefers_plain() {
        let raw = "--alt\n\
Content-Type: text/plain\n\
\n\
plain version\n\
--alt\n\
Content-Type: text/html\n\
\n\
<p>html version</p>\n\
--alt--\n";
        let body = multipart("multipart/alternative; boundary=alt", raw);
        assert_eq!(body.text, "plain version");
    }

    #[test]
    fn test_nested_multipart() {
        let raw = "--outer\n\
Content-Type: multipart/alternative; boundary=inner\n\
\n\
--inner\n\
Content-Type: text/html\n\
\n\
<p>Tom &amp; Jerry</p>\n\
--inner--\n\
--outer--\n";
        let body = multipart("multipart/mixed; boundary=outer", raw);
        assert_eq!(body.text, "Tom & Jerry");
    }

    #[test]
    fn test_crlf_multipart() {
        let raw = "--B\r\nContent-Type: text/plain\r\n\r\nwindows text\r\n--B--\r\n";
        let body = multipart("multipart/mixed; boundary=B", raw);
        assert_eq!(body.text, "windows text");
    }

    #[test]
    fn test_decode_quoted_printable() {
        assert_eq!(decode_quoted_printable(b"a=3Db"), b"a=b");
        assert_eq!(decode_quoted_printable(b"soft=\r\nbreak"), b"softbreak");
        assert_eq!(decode_quoted_printable(b"bad=ZZescape"), b"bad=ZZescape");
        assert_eq!(decode_quoted_printable(b"trailing="), b"trailing");
    }

    #[test]
    fn test_content_type_param() {
        let ct = "multipart/mixed; charset=utf-8; BOUNDARY=\"abc;def\"";
        assert_eq!(content_type_param(ct, "charset").as_deref(), Some("utf-8"));
        assert_eq!(content_type_param(ct, "boundary").as_deref(), Some("abc;def"));
        assert_eq!(mime_type(ct), "multipart/mixed");
        assert!(content_type_param("text/plain", "boundary").is_none());
    }

    #[test]
    fn test_html_to_text_removes_scripts() {
        assert_eq!(html_to_text("Before<script>alert('x')</script>After"), "BeforeAfter");
        assert_eq!(html_to_text("&amp;lt;"), "&lt;");
    }
}
