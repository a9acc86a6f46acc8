//! Ledger of per-unit log entries.
//!
//! The ledger owns sequence allocation and status. Writers go through the
//! `Ledger` trait so the orchestrator works the same against the durable SQLite
//! store and the in-memory store used by tests.

mod memory;
mod sqlite;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use memory::InMemoryLedger;
pub use sqlite::SqliteLedger;

use crate::error::IngestError;

/// Processing status of a log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogStatus {
    Uploading,
    Uploaded,
    LogFileMoved,
    ZeroData,
    CombinedWithLaterLog,
    ProcessingComplete,
    Duplicate,
}

impl LogStatus {
    pub const ALL: [LogStatus; 7] = [
        LogStatus::Uploading,
        LogStatus::Uploaded,
        LogStatus::LogFileMoved,
        LogStatus::ZeroData,
        LogStatus::CombinedWithLaterLog,
        LogStatus::ProcessingComplete,
        LogStatus::Duplicate,
    ];

    /// Stored and displayed text.
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Uploading => "Uploading",
            LogStatus::Uploaded => "Uploaded",
            LogStatus::LogFileMoved => "LOG file Moved",
            LogStatus::ZeroData => "Zero Data",
            LogStatus::CombinedWithLaterLog => "Combined With Later LOG",
            LogStatus::ProcessingComplete => "Processing Complete",
            LogStatus::Duplicate => "Duplicate",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LogStatus::ZeroData
                | LogStatus::CombinedWithLaterLog
                | LogStatus::ProcessingComplete
                | LogStatus::Duplicate
        )
    }

    /// Transition table. Re-asserting the current status is always allowed.
    pub fn can_transition_to(self, next: LogStatus) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (LogStatus::Uploading, LogStatus::Uploaded)
                | (LogStatus::Uploaded, LogStatus::LogFileMoved)
                | (LogStatus::Uploaded, LogStatus::Duplicate)
                | (LogStatus::Uploaded, LogStatus::CombinedWithLaterLog)
                | (LogStatus::LogFileMoved, LogStatus::ZeroData)
                | (LogStatus::LogFileMoved, LogStatus::ProcessingComplete)
        )
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        LogStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unrecognized log status {:?}", s))
    }
}

pub(crate) fn check_transition(id: &str, from: LogStatus, to: LogStatus) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(IngestError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        }
        .into());
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub unit_number: String,
    pub sequence: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub length_secs: Option<f64>,
    pub samples: Option<u64>,
    pub content_hash: Option<String>,
    pub status: LogStatus,
    pub original_file_name: String,
    pub upload_time: DateTime<Utc>,
}

impl LogEntry {
    /// Output file stem: `<unit_number>_<sequence:05>`.
    pub fn file_stem(&self) -> String {
        file_stem(&self.unit_number, self.sequence)
    }
}

pub fn file_stem(unit_number: &str, sequence: u32) -> String {
    format!("{}_{:05}", unit_number, sequence)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub unit_number: String,
    pub vehicle_type: String,
    pub serial_number: Option<String>,
    pub status: Option<String>,
}

/// Fields for a new entry.
#[derive(Clone, Debug)]
pub struct NewLogEntry<'a> {
    pub unit_number: &'a str,
    pub start_time: DateTime<Utc>,
    pub content_hash: Option<&'a str>,
    pub original_file_name: &'a str,
    pub status: LogStatus,
}

pub trait Ledger {
    /// Entry of `unit_number` whose head content hashed to `hash`.
    fn find_by_hash(&mut self, hash: &str, unit_number: &str) -> Result<Option<LogEntry>>;

    /// New `Uploaded` entry with the next sequence number for the unit.
    fn create(
        &mut self,
        unit_number: &str,
        start_time: DateTime<Utc>,
        hash: &str,
        original_file_name: &str,
    ) -> Result<LogEntry> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_with_id(
            &id,
            NewLogEntry {
                unit_number,
                start_time,
                content_hash: Some(hash),
                original_file_name,
                status: LogStatus::Uploaded,
            },
        )
    }

    /// New entry under a caller-chosen id. Sequence allocation is atomic.
    fn create_with_id(&mut self, id: &str, entry: NewLogEntry<'_>) -> Result<LogEntry>;

    fn update_status(&mut self, id: &str, status: LogStatus) -> Result<()>;

    fn update_length(&mut self, id: &str, length_secs: f64, samples: u64) -> Result<()>;

    fn update_end_time(&mut self, id: &str, end_time: DateTime<Utc>) -> Result<()>;

    fn get(&mut self, id: &str) -> Result<Option<LogEntry>>;

    /// Entry created upstream for the input file `original_file_name`.
    fn find_by_original_name(
        &mut self,
        unit_number: Option<&str>,
        original_file_name: &str,
    ) -> Result<Option<LogEntry>>;

    /// Attach decoded start time and content hash to an upstream entry.
    fn bind_content(&mut self, id: &str, start_time: DateTime<Utc>, hash: &str) -> Result<()>;

    /// All entries of a unit in sequence order.
    fn entries_for_unit(&mut self, unit_number: &str) -> Result<Vec<LogEntry>>;

    fn entries_with_status(&mut self, status: LogStatus) -> Result<Vec<LogEntry>>;

    /// Insert the vehicle if unknown; an existing vehicle is returned unchanged.
    fn ensure_vehicle(&mut self, unit_number: &str, vehicle_type: &str) -> Result<Vehicle>;

    fn vehicle(&mut self, unit_number: &str) -> Result<Option<Vehicle>>;
}
