//! Archive parsing: MBOX splitting, header decoding, MIME bodies and patch detection.

pub mod header;
pub mod mbox;
pub mod mime;
pub mod patch;

pub use mbox::{parse_bytes, parse_file, MboxParser, ParseOutcome, ParseStats};
