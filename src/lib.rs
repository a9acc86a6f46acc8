//! CAN capture ingestion core.
//!
//! Raw CAN captures arrive as text log files from vehicle loggers. This crate
//! turns each capture session into one registered, archived and encoded session:
//!
//! - `ingest`: decode a capture file (JSON header + CSV or DAT rows) into frames
//! - `stitch`: merge files chained by the continuation sentinel into one timeline
//! - `ledger`: per-unit sequence numbers, content hashes and processing status
//! - `orchestrator`: per-file lifecycle and the polling loop
//! - `archive`: unit-scoped output layout and crash-safe moves
//! - `encoder`: boundary to the measurement-container codec
//! - `upload`: staged acceptance of uploaded logs

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};

pub mod archive;
pub mod config;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod ledger;
pub mod orchestrator;
pub mod report;
pub mod stitch;
pub mod ui;
pub mod upload;

pub use archive::{relocate, write_atomic, OutputPresence, UnitLayout};
pub use config::IngestConfig;
pub use encoder::{resolve_dbc_files, NdjsonEncoder, SessionEncoder};
pub use error::{IngestError, RowError};
pub use frame::{content_hash, Frame};
pub use ingest::{decode_file, CaptureHeader, DecodedCapture, Dialect, CONTINUATION_SENTINEL};
pub use ledger::{InMemoryLedger, Ledger, LogEntry, LogStatus, SqliteLedger, Vehicle};
pub use orchestrator::{Orchestrator, Outcome, PipelineSettings, RunSummary};
pub use report::{LogReporter, RecordingReporter, Reporter, Warning};
pub use stitch::{stitch, ArchivedSegments, InputDirSegments, SegmentSource, StitchOptions};
pub use upload::UploadAcceptor;

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:canlog_ingest_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
