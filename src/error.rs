//! Error taxonomy for the ingestion pipeline.
//!
//! Fallible operations return `anyhow::Result`; the variants below travel inside
//! the `anyhow::Error` so the orchestrator (and tests) can `downcast_ref` them to
//! decide whether a failure is isolated to one file, one row, or one chain.

use std::path::PathBuf;

use thiserror::Error;

use crate::ledger::LogStatus;

#[derive(Error, Debug)]
pub enum IngestError {
    /// The first line of a capture file is not a usable JSON header.
    /// Fatal for that file only; the file is left in place for inspection.
    #[error("header error in {path}: {reason}")]
    Header { path: PathBuf, reason: String },

    /// A single malformed row. Recovered by dropping the row.
    #[error(transparent)]
    RowDecode(#[from] RowError),

    /// A continuation segment belongs to a different unit. Truncates the chain.
    #[error(
        "continuation {path} is unit {found_type}/{found_number}, expected {expected_type}/{expected_number}"
    )]
    ContinuationMismatch {
        path: PathBuf,
        expected_type: String,
        expected_number: String,
        found_type: String,
        found_number: String,
    },

    /// Frame content already registered for this unit.
    #[error("duplicate session for unit {unit_number} (matches entry {existing_id})")]
    DuplicateSession {
        unit_number: String,
        existing_id: String,
    },

    /// The external encoder failed; the entry stays before `Processing Complete`.
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: LogStatus,
        to: LogStatus,
    },

    #[error("unknown log entry {0}")]
    UnknownEntry(String),

    #[error("upload {0} was already accepted")]
    AlreadyAccepted(String),

    #[error("archive destination {0} already holds different content")]
    ArchiveConflict(PathBuf),
}

/// Why a data row was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("timestamp {0:?} is not a finite number of seconds within range")]
    Timestamp(String),
    #[error("bus field {0:?} is not a bus number")]
    Bus(String),
    #[error("extended flag {0:?} is not numeric")]
    Extended(String),
    #[error("arbitration id {0:?} is not hex")]
    ArbitrationId(String),
    #[error("data length {0:?} is out of range")]
    Length(String),
    #[error("data byte {0:?} is not hex")]
    DataByte(String),
    #[error("row has {0} columns")]
    Columns(usize),
    #[error("line does not match timestamp-bus-id#data")]
    Shape,
    #[error("payload has {0} bytes, at most 8 allowed")]
    PayloadTooLong(usize),
}
