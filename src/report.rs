//! Reporter interface handed to the decoder, stitcher and orchestrator.
//!
//! Nothing in the pipeline logs through a global handle directly; it reports to a
//! `Reporter`. `LogReporter` forwards to the `log` facade, `RecordingReporter`
//! keeps events in memory for assertions.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::RowError;

/// Non-fatal conditions worth an operator's attention.
#[derive(Clone, Debug, PartialEq)]
pub enum Warning {
    /// Next segment starts more than the configured threshold after the running end.
    TemporalGap {
        unit_number: String,
        segment: PathBuf,
        gap_secs: f64,
    },
    /// Next segment starts before the running session ends.
    ClockOverlap {
        unit_number: String,
        segment: PathBuf,
        overlap_secs: f64,
    },
    /// Unit identity changed mid-chain; the chain was truncated.
    ContinuationMismatch { head: PathBuf, segment: PathBuf },
    /// A continuation candidate could not be decoded; the chain ends before it.
    UnreadableSegment {
        head: PathBuf,
        segment: PathBuf,
        reason: String,
    },
    /// The file announced a successor that never showed up.
    MissingSuccessor { head: PathBuf },
    /// The chain hit the segment cap.
    ChainCapReached { head: PathBuf, cap: usize },
    MissingDbcFolder { folder: PathBuf },
    /// Device clock was probably not set when the capture started.
    ImplausibleStartTime { path: PathBuf, start: String },
    /// Non-blank lines after the continuation sentinel were ignored.
    TrailingAfterSentinel { path: PathBuf, lines: usize },
}

pub trait Reporter {
    fn row_dropped(&self, path: &Path, line_no: usize, reason: &RowError);

    fn rows_summary(&self, path: &Path, accepted: usize, dropped: usize);

    fn warning(&self, warning: Warning);
}

/// Reports through the `log` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn row_dropped(&self, path: &Path, line_no: usize, reason: &RowError) {
        log::debug!("{}:{}: dropped row: {}", path.display(), line_no, reason);
    }

    fn rows_summary(&self, path: &Path, accepted: usize, dropped: usize) {
        if dropped > 0 {
            log::info!(
                "{}: {} rows decoded, {} malformed rows dropped",
                path.display(),
                accepted,
                dropped
            );
        } else {
            log::debug!("{}: {} rows decoded", path.display(), accepted);
        }
    }

    fn warning(&self, warning: Warning) {
        match warning {
            Warning::TemporalGap {
                unit_number,
                segment,
                gap_secs,
            } => log::warn!(
                "unit {}: continuation {} starts {:.3}s after previous segment ended, possible data loss",
                unit_number,
                segment.display(),
                gap_secs
            ),
            Warning::ClockOverlap {
                unit_number,
                segment,
                overlap_secs,
            } => log::warn!(
                "unit {}: continuation {} starts {:.3}s before previous segment ended",
                unit_number,
                segment.display(),
                overlap_secs
            ),
            Warning::ContinuationMismatch { head, segment } => log::warn!(
                "continuation chain of {} stops at {}: unit identity differs",
                head.display(),
                segment.display()
            ),
            Warning::UnreadableSegment {
                head,
                segment,
                reason,
            } => log::warn!(
                "continuation chain of {} stops at {}: {}",
                head.display(),
                segment.display(),
                reason
            ),
            Warning::MissingSuccessor { head } => log::warn!(
                "{} continues but no successor file is present; finalizing what was merged",
                head.display()
            ),
            Warning::ChainCapReached { head, cap } => log::warn!(
                "continuation chain of {} reached {} segments; stopping",
                head.display(),
                cap
            ),
            Warning::MissingDbcFolder { folder } => {
                log::warn!("DBC folder {} not found", folder.display())
            }
            Warning::ImplausibleStartTime { path, start } => log::warn!(
                "{} has implausible start time {} (device clock not set?)",
                path.display(),
                start
            ),
            Warning::TrailingAfterSentinel { path, lines } => log::warn!(
                "{}: ignored {} lines after continuation marker",
                path.display(),
                lines
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReportEvent {
    RowDropped {
        path: PathBuf,
        line_no: usize,
        reason: RowError,
    },
    RowsSummary {
        path: PathBuf,
        accepted: usize,
        dropped: usize,
    },
    Warning(Warning),
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ReportEvent>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReportEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ReportEvent::Warning(w) => Some(w),
                _ => None,
            })
            .collect()
    }

    pub fn dropped_rows(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, ReportEvent::RowDropped { .. }))
            .count()
    }

    fn push(&self, event: ReportEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

impl Reporter for RecordingReporter {
    fn row_dropped(&self, path: &Path, line_no: usize, reason: &RowError) {
        self.push(ReportEvent::RowDropped {
            path: path.to_path_buf(),
            line_no,
            reason: reason.clone(),
        });
    }

    fn rows_summary(&self, path: &Path, accepted: usize, dropped: usize) {
        self.push(ReportEvent::RowsSummary {
            path: path.to_path_buf(),
            accepted,
            dropped,
        });
    }

    fn warning(&self, warning: Warning) {
        self.push(ReportEvent::Warning(warning));
    }
}
