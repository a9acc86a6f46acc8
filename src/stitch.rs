//! Continuation stitching.
//!
//! A logger that rolls over mid-session ends the file with the continuation
//! sentinel and starts a new file with a fresh header. The stitcher merges such a
//! chain into one session: each segment's timestamps are shifted by the running
//! cumulative length so the merged timeline is monotone, and every consumed
//! segment is archived as `<stem>_contNN.log`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::archive::{self, UnitLayout};
use crate::error::IngestError;
use crate::frame::Frame;
use crate::ingest::{decode_file, CaptureHeader, DecodedCapture};
use crate::ledger::{Ledger, LogStatus};
use crate::report::{Reporter, Warning};

pub const DEFAULT_GAP_WARNING_SECS: f64 = 10.0;
pub const DEFAULT_MAX_CHAIN_LEN: usize = 100;

#[derive(Clone, Debug)]
pub struct StitchOptions {
    /// Gap between segments above which a warning is reported.
    pub gap_warning_secs: f64,
    /// Most segments in one session, head included.
    pub max_chain_len: usize,
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self {
            gap_warning_secs: DEFAULT_GAP_WARNING_SECS,
            max_chain_len: DEFAULT_MAX_CHAIN_LEN,
        }
    }
}

/// A merged capture session.
#[derive(Clone, Debug)]
pub struct Session {
    /// Header of the head file.
    pub header: CaptureHeader,
    pub frames: Vec<Frame>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub length_secs: f64,
    pub samples: u64,
}

/// A continuation file merged into a session.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumedSegment {
    /// Name the file had when it was picked up.
    pub file_name: String,
    pub archived_path: PathBuf,
    pub start_time: DateTime<Utc>,
    /// Seconds added to each of the segment's frame timestamps.
    pub shift_secs: f64,
    pub frames: usize,
}

#[derive(Debug)]
pub struct StitchedSession {
    pub session: Session,
    pub segments: Vec<ConsumedSegment>,
    /// Set when the chain stopped at a segment from another unit.
    pub truncated_by: Option<IngestError>,
}

/// Supplies successor candidates for a continuing session.
pub trait SegmentSource {
    /// Next candidate, or `None` when no successor is available.
    fn next_segment(&mut self) -> Result<Option<PathBuf>>;

    /// `path` joined the chain; make it durable at `archived_as` and return where
    /// it lives now.
    fn accept(&mut self, path: &Path, archived_as: &Path) -> Result<PathBuf>;
}

/// Successors taken from the input directory, earliest name first.
pub struct InputDirSegments<'a> {
    dir: PathBuf,
    unit_number: String,
    excluded: HashSet<PathBuf>,
    consumed: HashSet<PathBuf>,
    ledger: Option<&'a mut dyn Ledger>,
    successor_wait: Duration,
    poll_step: Duration,
}

impl<'a> InputDirSegments<'a> {
    pub fn new(dir: &Path, unit_number: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            unit_number: unit_number.to_string(),
            excluded: HashSet::new(),
            consumed: HashSet::new(),
            ledger: None,
            successor_wait: Duration::ZERO,
            poll_step: Duration::from_millis(500),
        }
    }

    /// Skip files whose upstream ledger entry is still `Uploading`.
    pub fn with_ledger(mut self, ledger: &'a mut dyn Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Never offer these paths (quarantined files).
    pub fn excluding(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.excluded.extend(paths);
        self
    }

    /// Poll up to `wait` for a successor that has not arrived yet.
    pub fn waiting(mut self, wait: Duration) -> Self {
        self.successor_wait = wait;
        self
    }

    fn still_uploading(&mut self, file_name: &str) -> Result<bool> {
        let Some(ledger) = self.ledger.as_mut() else {
            return Ok(false);
        };
        Ok(ledger
            .find_by_original_name(Some(self.unit_number.as_str()), file_name)?
            .map_or(false, |entry| entry.status == LogStatus::Uploading))
    }

    fn earliest_candidate(&mut self) -> Result<Option<PathBuf>> {
        for path in list_capture_files(&self.dir)? {
            if self.excluded.contains(&path) || self.consumed.contains(&path) {
                continue;
            }
            let name = file_name_of(&path);
            if self.still_uploading(&name)? {
                continue;
            }
            return Ok(Some(path));
        }
        Ok(None)
    }
}

impl SegmentSource for InputDirSegments<'_> {
    fn next_segment(&mut self) -> Result<Option<PathBuf>> {
        let deadline = Instant::now() + self.successor_wait;
        loop {
            if let Some(path) = self.earliest_candidate()? {
                return Ok(Some(path));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.poll_step.min(deadline - now));
        }
    }

    fn accept(&mut self, path: &Path, archived_as: &Path) -> Result<PathBuf> {
        archive::relocate(path, archived_as)?;
        self.consumed.insert(path.to_path_buf());
        Ok(archived_as.to_path_buf())
    }
}

/// Successors that were already archived by an earlier, interrupted run.
pub struct ArchivedSegments {
    pending: std::vec::IntoIter<PathBuf>,
}

impl ArchivedSegments {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            pending: paths.into_iter(),
        }
    }
}

impl SegmentSource for ArchivedSegments {
    fn next_segment(&mut self) -> Result<Option<PathBuf>> {
        Ok(self.pending.next())
    }

    fn accept(&mut self, path: &Path, _archived_as: &Path) -> Result<PathBuf> {
        Ok(path.to_path_buf())
    }
}

/// `*.log` files (any case) in `dir`, sorted by name. Hidden files are skipped.
pub fn list_capture_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = file_name_of(&path);
        if name.starts_with('.') {
            continue;
        }
        let is_log = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("log"));
        if is_log {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>()
        .map_or(false, |e| e.kind() == io::ErrorKind::NotFound)
}

/// Running totals while a chain is merged.
struct Accumulator {
    frames: Vec<Frame>,
    length_secs: f64,
    samples: u64,
    end_time: DateTime<Utc>,
}

impl Accumulator {
    fn append(&mut self, segment: DecodedCapture) -> f64 {
        let shift = self.length_secs;
        self.length_secs += segment.length_secs();
        self.samples += segment.frames.len() as u64;
        self.end_time = segment.end_time();
        self.frames.extend(segment.frames.into_iter().map(|mut frame| {
            frame.timestamp += shift;
            frame
        }));
        shift
    }
}

/// Merge `head` with its continuation files.
///
/// Stops at the first segment from another unit (left where it is), when no
/// successor is available, or at the chain cap. Those stops are reported as
/// warnings; only I/O failures while archiving are errors.
pub fn stitch(
    head: DecodedCapture,
    layout: &UnitLayout,
    stem: &str,
    source: &mut dyn SegmentSource,
    reporter: &dyn Reporter,
    options: &StitchOptions,
) -> Result<StitchedSession> {
    let head_path = head.path.clone();
    let header = head.header.clone();
    let mut continues = head.continues;
    let mut acc = Accumulator {
        length_secs: head.length_secs(),
        samples: head.frames.len() as u64,
        end_time: head.end_time(),
        frames: head.frames,
    };
    let mut segments: Vec<ConsumedSegment> = Vec::new();
    let mut truncated_by = None;

    while continues {
        if segments.len() + 1 >= options.max_chain_len {
            reporter.warning(Warning::ChainCapReached {
                head: head_path.clone(),
                cap: options.max_chain_len,
            });
            break;
        }
        let Some(candidate) = source.next_segment()? else {
            reporter.warning(Warning::MissingSuccessor {
                head: head_path.clone(),
            });
            break;
        };
        let next = match decode_file(&candidate, reporter) {
            Ok(next) => next,
            Err(e) if is_not_found(&e) => continue,
            Err(e) => {
                reporter.warning(Warning::UnreadableSegment {
                    head: head_path.clone(),
                    segment: candidate,
                    reason: format!("{:#}", e),
                });
                break;
            }
        };

        if !next.header.same_unit(&header) {
            reporter.warning(Warning::ContinuationMismatch {
                head: head_path.clone(),
                segment: candidate.clone(),
            });
            truncated_by = Some(IngestError::ContinuationMismatch {
                path: candidate,
                expected_type: header.unit_type.clone(),
                expected_number: header.unit_number.clone(),
                found_type: next.header.unit_type.clone(),
                found_number: next.header.unit_number.clone(),
            });
            break;
        }

        let start_delta = (next.header.log_start_time - acc.end_time)
            .num_microseconds()
            .map_or(0.0, |us| us as f64 / 1_000_000.0);
        if start_delta > options.gap_warning_secs {
            reporter.warning(Warning::TemporalGap {
                unit_number: header.unit_number.clone(),
                segment: candidate.clone(),
                gap_secs: start_delta,
            });
        } else if start_delta < 0.0 {
            reporter.warning(Warning::ClockOverlap {
                unit_number: header.unit_number.clone(),
                segment: candidate.clone(),
                overlap_secs: -start_delta,
            });
        }

        let file_name = next.file_name();
        let start_time = next.header.log_start_time;
        let frames = next.frames.len();
        continues = next.continues;
        let shift_secs = acc.append(next);

        let archived_as = layout.continuation_log(stem, segments.len() + 1);
        let archived_path = source.accept(&candidate, &archived_as)?;
        log::info!(
            "merged {} into {} at +{:.3}s ({} frames)",
            file_name,
            stem,
            shift_secs,
            frames
        );
        segments.push(ConsumedSegment {
            file_name,
            archived_path,
            start_time,
            shift_secs,
            frames,
        });
    }

    Ok(StitchedSession {
        session: Session {
            start_time: header.log_start_time,
            header,
            frames: acc.frames,
            end_time: acc.end_time,
            length_secs: acc.length_secs,
            samples: acc.samples,
        },
        segments,
        truncated_by,
    })
}
