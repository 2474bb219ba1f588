//! Line format of the record file.
//!
//! One record per line: `<identity> <count> <epoch-seconds>`. The identity is percent-escaped
//! (`%`, space, tab, LF and CR) so the three fields always split cleanly and a line never
//! spans more than one physical line.
//!
//! Lines that start with a space are read in the legacy unescaped layout
//! `" <identity> <count> <epoch-seconds>"`; they are written back in the escaped layout on the
//! next rewrite. Empty identities would be indistinguishable from that layout and are never
//! written.

use super::FailureRecord;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

/// A line that could not be parsed. Line numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    pub line: usize,
    pub reason: &'static str,
}

impl fmt::Display for MalformedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

/// Result of parsing a whole record file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    pub records: Vec<FailureRecord>,
    pub malformed: Vec<MalformedLine>,
    /// Identities that appeared more than once; the last occurrence was kept.
    pub duplicates: Vec<String>,
    /// Number of records read from legacy-layout lines.
    pub legacy: usize,
}

pub fn escape_identity(identity: &str) -> Cow<'_, str> {
    if !identity.contains(|c: char| matches!(c, '%' | ' ' | '\t' | '\n' | '\r')) {
        return Cow::Borrowed(identity);
    }
    let mut out = String::with_capacity(identity.len() + 8);
    for ch in identity.chars() {
        match ch {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '\t' => out.push_str("%09"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

pub fn unescape_identity(field: &str) -> Result<String, &'static str> {
    if !field.contains('%') {
        return Ok(field.to_string());
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3).ok_or("truncated escape")?;
            let hex = std::str::from_utf8(hex).map_err(|_| "invalid escape")?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| "invalid escape")?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| "escape decodes to invalid utf-8")
}

pub fn encode_line(record: &FailureRecord) -> String {
    format!(
        "{} {} {}\n",
        escape_identity(record.identity()),
        record.failure_count(),
        record.last_failure()
    )
}

pub fn encode(records: &[FailureRecord]) -> String {
    records.iter().map(encode_line).collect()
}

fn parse_numbers(count: &str, timestamp: &str) -> Result<(u32, u64), &'static str> {
    let count: u32 = count.parse().map_err(|_| "invalid failure count")?;
    if count == 0 {
        return Err("zero failure count");
    }
    let timestamp: u64 = timestamp.parse().map_err(|_| "invalid timestamp")?;
    Ok((count, timestamp))
}

fn parse_escaped(line: &str) -> Result<FailureRecord, &'static str> {
    let mut fields = line.split(' ');
    let (Some(identity), Some(count), Some(timestamp), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err("expected 3 fields");
    };
    if identity.is_empty() {
        return Err("empty identity");
    }
    let identity = unescape_identity(identity)?;
    let (count, timestamp) = parse_numbers(count, timestamp)?;
    Ok(FailureRecord::new(identity, count, timestamp))
}

fn parse_legacy(line: &str) -> Result<FailureRecord, &'static str> {
    let body = line.trim_start_matches(' ');
    let mut fields = body.rsplitn(3, ' ');
    let (Some(timestamp), Some(count), Some(identity)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return Err("expected 3 fields");
    };
    let identity = identity.trim_end_matches(' ');
    if identity.is_empty() {
        return Err("empty identity");
    }
    let (count, timestamp) = parse_numbers(count, timestamp.trim())?;
    Ok(FailureRecord::new(identity, count, timestamp))
}

/// Parse a record file. Blank lines are ignored; malformed lines, including ones that are not
/// valid UTF-8, are reported and skipped.
pub fn decode(raw: impl AsRef<[u8]>) -> Decoded {
    let mut decoded = Decoded::default();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (n, bytes) in raw.as_ref().split(|&b| b == b'\n').enumerate() {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        let Ok(line) = std::str::from_utf8(bytes) else {
            decoded.malformed.push(MalformedLine { line: n + 1, reason: "invalid utf-8" });
            continue;
        };
        if line.trim().is_empty() {
            continue;
        }
        let legacy = line.starts_with(' ');
        let parsed = if legacy { parse_legacy(line) } else { parse_escaped(line) };
        let record = match parsed {
            Ok(record) => record,
            Err(reason) => {
                decoded.malformed.push(MalformedLine { line: n + 1, reason });
                continue;
            }
        };
        if legacy {
            decoded.legacy += 1;
        }
        match index.get(record.identity()) {
            Some(&pos) => {
                decoded.duplicates.push(record.identity().to_string());
                decoded.records[pos] = record;
            }
            None => {
                index.insert(record.identity().to_string(), decoded.records.len());
                decoded.records.push(record);
            }
        }
    }

    decoded
}
