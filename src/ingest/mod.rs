//! Capture file decoding.
//!
//! A capture file is one JSON header line followed by rows in one of two dialects:
//! - CSV: `timestamp,bus,extended,id,len,d0..d7` (see `csv`)
//! - DAT: `timestamp-bus-id#payload` (see `dat`)
//!
//! The dialect is chosen once from the header's `log_type` tag. Malformed rows are
//! dropped and counted; only an unusable header fails the file. A file whose last
//! line is the continuation sentinel announces a successor file.

mod csv;
mod dat;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{IngestError, RowError};
use crate::frame::{sequence_length, Frame};
use crate::report::{Reporter, Warning};

/// Last line of a file that is continued by the next file.
pub const CONTINUATION_SENTINEL: &str = "---- EOF NEXT FILE TO FOLLOW ----";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Csv,
    Dat,
}

impl Dialect {
    /// `log_type` values starting with "DAT" select DAT; everything else is CSV.
    pub fn from_log_type(log_type: Option<&str>) -> Self {
        match log_type {
            Some(tag) if tag.starts_with("DAT") => Dialect::Dat,
            _ => Dialect::Csv,
        }
    }

    fn parse_row(self, line: &str) -> std::result::Result<Frame, RowError> {
        match self {
            Dialect::Csv => csv::parse_row(line),
            Dialect::Dat => dat::parse_line(line),
        }
    }

    fn is_column_title(self, line: &str) -> bool {
        match self {
            Dialect::Csv => csv::is_column_title(line),
            Dialect::Dat => dat::is_column_title(line),
        }
    }
}

/// Metadata from the first line of a capture file.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureHeader {
    pub unit_type: String,
    pub unit_number: String,
    pub log_start_time: DateTime<Utc>,
    /// `log_start_time` exactly as written by the logger.
    pub raw_start_time: String,
    pub log_type: Option<String>,
    pub dialect: Dialect,
    /// Remaining header keys (per-bus descriptors and the like), passed through.
    pub extra: Map<String, Value>,
}

impl CaptureHeader {
    pub fn same_unit(&self, other: &CaptureHeader) -> bool {
        self.unit_number == other.unit_number && self.unit_type == other.unit_type
    }
}

#[derive(Clone, Debug)]
pub struct DecodedCapture {
    pub path: PathBuf,
    pub header: CaptureHeader,
    pub frames: Vec<Frame>,
    pub continues: bool,
    pub dropped_rows: usize,
}

impl DecodedCapture {
    /// Own length of this file: its last frame's timestamp.
    pub fn length_secs(&self) -> f64 {
        sequence_length(&self.frames)
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        offset_time(self.header.log_start_time, self.length_secs())
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Largest row timestamp magnitude accepted, in seconds (about 31 years).
pub const MAX_ROW_TIMESTAMP_SECS: f64 = 1.0e9;

/// `start + seconds`, at microsecond resolution. Saturates at the ends of the
/// representable range.
pub fn offset_time(start: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    let micros = (seconds * 1_000_000.0).round();
    let saturated = if micros.is_sign_negative() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    };
    if !micros.is_finite() {
        return saturated;
    }
    // `as` clamps to the i64 range; the constructor cannot overflow.
    start
        .checked_add_signed(chrono::Duration::microseconds(micros as i64))
        .unwrap_or(saturated)
}

/// Path component rule for unit numbers and unit types (they become directories).
pub fn validate_unit_component(value: &str) -> Result<()> {
    static UNIT_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = UNIT_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").unwrap());
    if !re.is_match(value) {
        return Err(anyhow::anyhow!(
            "{:?} must match ^[A-Za-z0-9][A-Za-z0-9_.-]{{0,63}}$",
            value
        ));
    }
    Ok(())
}

/// Decode one capture file.
pub fn decode_file(path: &Path, reporter: &dyn Reporter) -> Result<DecodedCapture> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut first = Vec::new();
    reader.read_until(b'\n', &mut first)?;
    let header = parse_header(path, &String::from_utf8_lossy(&first))?;
    if header.log_start_time < earliest_plausible_start() {
        reporter.warning(Warning::ImplausibleStartTime {
            path: path.to_path_buf(),
            start: header.raw_start_time.clone(),
        });
    }

    let mut frames = Vec::new();
    let mut dropped_rows = 0usize;
    let mut continues = false;
    let mut trailing = 0usize;
    let mut seen_body_line = false;
    let mut line_no = 1usize;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim();
        if line.is_empty() {
            continue;
        }
        if continues {
            trailing += 1;
            continue;
        }
        if line == CONTINUATION_SENTINEL {
            continues = true;
            continue;
        }
        let first_body_line = !seen_body_line;
        seen_body_line = true;
        if first_body_line && header.dialect.is_column_title(line) {
            continue;
        }
        match header.dialect.parse_row(line) {
            Ok(frame) => frames.push(frame),
            Err(reason) => {
                dropped_rows += 1;
                reporter.row_dropped(path, line_no, &reason);
            }
        }
    }

    if trailing > 0 {
        reporter.warning(Warning::TrailingAfterSentinel {
            path: path.to_path_buf(),
            lines: trailing,
        });
    }
    reporter.rows_summary(path, frames.len(), dropped_rows);

    Ok(DecodedCapture {
        path: path.to_path_buf(),
        header,
        frames,
        continues,
        dropped_rows,
    })
}

fn header_error(path: &Path, reason: impl Into<String>) -> anyhow::Error {
    IngestError::Header {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
    .into()
}

fn parse_header(path: &Path, line: &str) -> Result<CaptureHeader> {
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|e| header_error(path, format!("first line is not JSON: {}", e)))?;
    let Value::Object(mut map) = value else {
        return Err(header_error(path, "header is not a JSON object"));
    };

    let unit_type = take_text(&mut map, "unit_type").ok_or_else(|| header_error(path, "missing unit_type"))?;
    let unit_number =
        take_text(&mut map, "unit_number").ok_or_else(|| header_error(path, "missing unit_number"))?;
    let raw_start_time = take_text(&mut map, "log_start_time")
        .ok_or_else(|| header_error(path, "missing log_start_time"))?;
    let log_type = take_text(&mut map, "log_type");

    validate_unit_component(&unit_type).map_err(|e| header_error(path, format!("unit_type {}", e)))?;
    validate_unit_component(&unit_number)
        .map_err(|e| header_error(path, format!("unit_number {}", e)))?;
    let log_start_time = parse_start_time(&raw_start_time)
        .ok_or_else(|| header_error(path, format!("unparseable log_start_time {:?}", raw_start_time)))?;

    Ok(CaptureHeader {
        dialect: Dialect::from_log_type(log_type.as_deref()),
        unit_type,
        unit_number,
        log_start_time,
        raw_start_time,
        log_type,
        extra: map,
    })
}

/// Strings are taken as-is; numbers are accepted for ids some loggers emit numerically.
fn take_text(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
pub fn parse_start_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn earliest_plausible_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 2, 1, 1, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Parse base-16 text the way loggers write it (optional `0x` prefix).
pub(crate) fn parse_hex(text: &str) -> Option<u32> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

pub(crate) fn parse_timestamp(text: &str) -> Option<f64> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|ts| ts.is_finite() && ts.abs() <= MAX_ROW_TIMESTAMP_SECS)
}
