//! Per-file processing and the polling loop.
//!
//! One input file is taken through the whole lifecycle before the next is
//! looked at:
//!
//! ```text
//! decode head -> dedup -> register -> archive head -> LOG file Moved
//!   -> stitch continuations -> encode -> Processing Complete
//!                           \-> no frames -> Zero Data
//! ```
//!
//! Ledger status only advances after the corresponding file operation is
//! durable. A crash therefore leaves the input file in place, an entry at
//! `LOG file Moved`, or an `Uploaded` entry whose file has already been
//! archived. `resume_pending` finishes the last two.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::archive::{relocate, write_atomic, UnitLayout};
use crate::encoder::{resolve_dbc_files, SessionEncoder};
use crate::error::IngestError;
use crate::frame::content_hash;
use crate::ingest::{decode_file, DecodedCapture};
use crate::ledger::{Ledger, LogEntry, LogStatus};
use crate::report::Reporter;
use crate::stitch::{
    list_capture_files, stitch, ArchivedSegments, InputDirSegments, SegmentSource, Session,
    StitchOptions,
};

/// Directories and timing the orchestrator works with.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub dbc_dir: PathBuf,
    pub stitch: StitchOptions,
    /// How long a continuing session waits for its next file to appear.
    pub successor_wait: Duration,
    /// Sleep between scans when the input directory is idle.
    pub poll_interval: Duration,
}

impl PipelineSettings {
    /// Standard layout under one data directory, no successor wait.
    pub fn under(data_dir: &Path) -> Self {
        Self {
            input_dir: data_dir.join("in_logs"),
            output_dir: data_dir.join("out"),
            dbc_dir: data_dir.join("dbc"),
            stitch: StitchOptions::default(),
            successor_wait: Duration::ZERO,
            poll_interval: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Completed {
        id: String,
        stem: String,
        samples: u64,
        segments: usize,
    },
    ZeroData {
        id: String,
        stem: String,
    },
    /// Head content already registered for this unit; the file was archived aside.
    Duplicate {
        existing_id: String,
        archived_as: PathBuf,
    },
    /// The upload has not finished; the file was left alone.
    StillUploading,
}

/// Counts from one pass over the input directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub zero_data: usize,
    pub duplicates: usize,
    pub waiting: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn is_idle(&self) -> bool {
        self.completed + self.zero_data + self.duplicates + self.failed == 0
    }

    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Completed { .. } => self.completed += 1,
            Outcome::ZeroData { .. } => self.zero_data += 1,
            Outcome::Duplicate { .. } => self.duplicates += 1,
            Outcome::StillUploading => self.waiting += 1,
        }
    }
}

pub struct Orchestrator<L, E, R> {
    settings: PipelineSettings,
    ledger: L,
    encoder: E,
    reporter: R,
    /// Files that failed, with the modification time they failed at.
    quarantine: HashMap<PathBuf, Option<SystemTime>>,
}

impl<L: Ledger, E: SessionEncoder, R: Reporter> Orchestrator<L, E, R> {
    pub fn new(settings: PipelineSettings, ledger: L, encoder: E, reporter: R) -> Self {
        Self {
            settings,
            ledger,
            encoder,
            reporter,
            quarantine: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn into_ledger(self) -> L {
        self.ledger
    }

    /// Take one input file through the whole lifecycle.
    pub fn process_file(&mut self, path: &Path) -> Result<Outcome> {
        let file_name = file_name_of(path);
        if let Some(upstream) = self.ledger.find_by_original_name(None, &file_name)? {
            if upstream.status == LogStatus::Uploading {
                log::debug!("{} is still uploading", file_name);
                return Ok(Outcome::StillUploading);
            }
        }

        let head = decode_file(path, &self.reporter)?;
        let unit_type = head.header.unit_type.clone();
        let unit_number = head.header.unit_number.clone();
        self.ledger.ensure_vehicle(&unit_number, &unit_type)?;
        let layout = UnitLayout::new(&self.settings.output_dir, &unit_type, &unit_number);
        layout.create_dirs()?;

        let entry = match self.register(&head, &file_name) {
            Ok(entry) => entry,
            Err(e) => match e.downcast_ref::<IngestError>() {
                Some(IngestError::DuplicateSession { existing_id, .. }) => {
                    let existing_id = existing_id.clone();
                    return self.set_aside_duplicate(
                        head,
                        &layout,
                        &unit_number,
                        &file_name,
                        existing_id,
                    );
                }
                _ => return Err(e),
            },
        };
        let stem = entry.file_stem();

        relocate(path, &layout.archived_log(&stem))?;
        self.ledger.update_status(&entry.id, LogStatus::LogFileMoved)?;
        log::info!("{} registered as {}", file_name, stem);

        if head.frames.is_empty() && !head.continues {
            return self.finish_zero_data(&entry, head.header.log_start_time);
        }

        let quarantined: Vec<PathBuf> = self.quarantine.keys().cloned().collect();
        let stitched = {
            let mut source = InputDirSegments::new(&self.settings.input_dir, &unit_number)
                .with_ledger(&mut self.ledger)
                .excluding(quarantined)
                .waiting(self.settings.successor_wait);
            stitch(
                head,
                &layout,
                &stem,
                &mut source,
                &self.reporter,
                &self.settings.stitch,
            )?
        };
        if let Some(mismatch) = &stitched.truncated_by {
            log::warn!("{}: {}", stem, mismatch);
        }
        for segment in &stitched.segments {
            self.mark_upstream(
                &unit_number,
                &segment.file_name,
                LogStatus::CombinedWithLaterLog,
            )?;
        }
        let segments = stitched.segments.len();
        self.finalize(&entry, &layout, stitched.session, segments)
    }

    /// Process input files until none is left that can be handled now.
    ///
    /// The directory is listed again before each file. A failing file is logged,
    /// left where it is, and not retried until it changes.
    pub fn run_once(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut passed_over: HashSet<PathBuf> = HashSet::new();
        loop {
            let next = list_capture_files(&self.settings.input_dir)?
                .into_iter()
                .find(|path| !passed_over.contains(path) && !self.is_quarantined(path));
            let Some(path) = next else {
                break;
            };
            match self.process_file(&path) {
                Ok(outcome) => {
                    summary.record(&outcome);
                    if path.exists() {
                        passed_over.insert(path);
                    }
                }
                Err(e) => {
                    log::error!("failed to process {}: {:#}", path.display(), e);
                    summary.failed += 1;
                    if path.exists() {
                        self.quarantine_file(&path);
                    }
                    passed_over.insert(path);
                }
            }
        }
        Ok(summary)
    }

    /// Scan until `shutdown` is set, sleeping `poll_interval` when idle.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        log::info!(
            "watching {} (poll every {}s)",
            self.settings.input_dir.display(),
            self.settings.poll_interval.as_secs()
        );
        while !shutdown.load(Ordering::SeqCst) {
            let idle = match self.run_once() {
                Ok(summary) => {
                    if !summary.is_idle() {
                        log::info!(
                            "pass done: {} complete, {} zero data, {} duplicate, {} failed",
                            summary.completed,
                            summary.zero_data,
                            summary.duplicates,
                            summary.failed
                        );
                    }
                    summary.is_idle()
                }
                Err(e) => {
                    log::error!("scan of {} failed: {:#}", self.settings.input_dir.display(), e);
                    true
                }
            };
            if idle {
                sleep_unless_shutdown(self.settings.poll_interval, shutdown);
            }
        }
        log::info!("shutdown requested; stopping");
        Ok(())
    }

    /// Finish entries left at `LOG file Moved` by a crash or a failed encode,
    /// from their archived files. `Uploaded` entries whose file was archived
    /// before the status change was recorded are caught up first.
    pub fn resume_pending(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for entry in self.ledger.entries_with_status(LogStatus::Uploaded)? {
            if let Err(e) = self.recover_interrupted_move(&entry) {
                log::error!(
                    "could not recover {} ({}): {:#}",
                    entry.original_file_name,
                    entry.file_stem(),
                    e
                );
                summary.failed += 1;
            }
        }
        for entry in self.ledger.entries_with_status(LogStatus::LogFileMoved)? {
            match self.resume_entry(&entry) {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    log::error!("could not resume {}: {:#}", entry.file_stem(), e);
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Bring an `Uploaded` entry whose input file is gone in line with where
    /// the file went: archived as a session head, set aside as a duplicate, or
    /// merged into another session.
    fn recover_interrupted_move(&mut self, entry: &LogEntry) -> Result<()> {
        if self
            .settings
            .input_dir
            .join(&entry.original_file_name)
            .exists()
        {
            return Ok(());
        }
        let Some(vehicle) = self.ledger.vehicle(&entry.unit_number)? else {
            return Ok(());
        };
        let layout = UnitLayout::new(
            &self.settings.output_dir,
            &vehicle.vehicle_type,
            &entry.unit_number,
        );
        let status = if layout.archived_log(&entry.file_stem()).exists() {
            LogStatus::LogFileMoved
        } else if layout.has_duplicate_of(&original_stem(&entry.original_file_name)) {
            LogStatus::Duplicate
        } else if layout.has_continuations()? {
            LogStatus::CombinedWithLaterLog
        } else {
            log::warn!(
                "{} ({}) is no longer in {} and was not archived",
                entry.original_file_name,
                entry.file_stem(),
                self.settings.input_dir.display()
            );
            return Ok(());
        };
        log::info!(
            "{} was moved by an interrupted run; marking {}",
            entry.original_file_name,
            status
        );
        self.ledger.update_status(&entry.id, status)
    }

    fn resume_entry(&mut self, entry: &LogEntry) -> Result<Outcome> {
        let vehicle = self
            .ledger
            .vehicle(&entry.unit_number)?
            .ok_or_else(|| anyhow!("no vehicle recorded for unit {}", entry.unit_number))?;
        let layout = UnitLayout::new(
            &self.settings.output_dir,
            &vehicle.vehicle_type,
            &entry.unit_number,
        );
        let stem = entry.file_stem();
        let head = decode_file(&layout.archived_log(&stem), &self.reporter)?;
        log::info!("resuming {}", stem);

        let archived = ArchivedSegments::new(layout.archived_continuations(&stem)?);
        let quarantined: Vec<PathBuf> = self.quarantine.keys().cloned().collect();
        let stitched = {
            let live = InputDirSegments::new(&self.settings.input_dir, &entry.unit_number)
                .with_ledger(&mut self.ledger)
                .excluding(quarantined);
            let mut source = ResumeSegments {
                archived,
                live,
                from_archive: true,
            };
            stitch(
                head,
                &layout,
                &stem,
                &mut source,
                &self.reporter,
                &self.settings.stitch,
            )?
        };
        for segment in &stitched.segments {
            self.mark_upstream(
                &entry.unit_number,
                &segment.file_name,
                LogStatus::CombinedWithLaterLog,
            )?;
        }
        let segments = stitched.segments.len();
        self.finalize(entry, &layout, stitched.session, segments)
    }

    /// Entry for a new head file, or `DuplicateSession` when its frames are known.
    fn register(&mut self, head: &DecodedCapture, file_name: &str) -> Result<LogEntry> {
        let unit_number = head.header.unit_number.as_str();
        let hash = content_hash(&head.frames);
        let own = self
            .ledger
            .find_by_original_name(Some(unit_number), file_name)?
            .filter(|entry| entry.status == LogStatus::Uploaded);

        // A head without frames carries nothing to compare.
        if !head.frames.is_empty() {
            if let Some(existing) = self.ledger.find_by_hash(&hash, unit_number)? {
                let is_own = own.as_ref().map_or(false, |entry| entry.id == existing.id);
                if !is_own {
                    return Err(IngestError::DuplicateSession {
                        unit_number: unit_number.to_string(),
                        existing_id: existing.id,
                    }
                    .into());
                }
            }
        }

        match own {
            Some(entry) => {
                self.ledger
                    .bind_content(&entry.id, head.header.log_start_time, &hash)?;
                Ok(entry)
            }
            None => self
                .ledger
                .create(unit_number, head.header.log_start_time, &hash, file_name),
        }
    }

    /// Archive a duplicate head aside, together with the continuation files
    /// it announces, so none of them is taken for a new session later.
    fn set_aside_duplicate(
        &mut self,
        head: DecodedCapture,
        layout: &UnitLayout,
        unit_number: &str,
        file_name: &str,
        existing_id: String,
    ) -> Result<Outcome> {
        let archived_as = layout.duplicate_log(&original_stem(file_name));
        relocate(&head.path, &archived_as)?;
        self.mark_upstream(unit_number, file_name, LogStatus::Duplicate)?;
        log::info!(
            "{} duplicates entry {}; archived as {}",
            file_name,
            existing_id,
            archived_as.display()
        );

        if head.continues {
            let duplicate_stem = original_stem(&file_name_of(&archived_as));
            let quarantined: Vec<PathBuf> = self.quarantine.keys().cloned().collect();
            let stitched = {
                let mut source = InputDirSegments::new(&self.settings.input_dir, unit_number)
                    .with_ledger(&mut self.ledger)
                    .excluding(quarantined)
                    .waiting(self.settings.successor_wait);
                stitch(
                    head,
                    layout,
                    &duplicate_stem,
                    &mut source,
                    &self.reporter,
                    &self.settings.stitch,
                )?
            };
            for segment in &stitched.segments {
                self.mark_upstream(unit_number, &segment.file_name, LogStatus::Duplicate)?;
            }
            log::info!(
                "{} continuation files of {} set aside with it",
                stitched.segments.len(),
                file_name
            );
        }

        Ok(Outcome::Duplicate {
            existing_id,
            archived_as,
        })
    }

    /// Move the upstream entry of `file_name`, if any, on from `Uploaded`.
    fn mark_upstream(
        &mut self,
        unit_number: &str,
        file_name: &str,
        status: LogStatus,
    ) -> Result<()> {
        if let Some(upstream) = self
            .ledger
            .find_by_original_name(Some(unit_number), file_name)?
            .filter(|entry| entry.status == LogStatus::Uploaded)
        {
            self.ledger.update_status(&upstream.id, status)?;
        }
        Ok(())
    }

    fn finish_zero_data(
        &mut self,
        entry: &LogEntry,
        start_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<Outcome> {
        self.ledger.update_length(&entry.id, 0.0, 0)?;
        self.ledger.update_end_time(&entry.id, start_time)?;
        self.ledger.update_status(&entry.id, LogStatus::ZeroData)?;
        log::info!("{} has no frames", entry.file_stem());
        Ok(Outcome::ZeroData {
            id: entry.id.clone(),
            stem: entry.file_stem(),
        })
    }

    fn finalize(
        &mut self,
        entry: &LogEntry,
        layout: &UnitLayout,
        session: Session,
        segments: usize,
    ) -> Result<Outcome> {
        if session.frames.is_empty() {
            return self.finish_zero_data(entry, session.start_time);
        }
        let stem = entry.file_stem();
        self.ledger
            .update_length(&entry.id, session.length_secs, session.samples)?;
        self.ledger.update_end_time(&entry.id, session.end_time)?;

        let dbc_files = resolve_dbc_files(
            &self.settings.dbc_dir,
            &session.header.unit_type,
            &self.reporter,
        )?;
        let ext = self.encoder.container_extension().to_string();
        let raw = self
            .encoder
            .encode(&session.frames)
            .map_err(|e| IngestError::Encode(format!("{:#}", e)))?;
        write_atomic(&layout.raw_container(&stem, &ext), &raw)?;
        let decoded = self
            .encoder
            .extract(&raw, &dbc_files)
            .map_err(|e| IngestError::Encode(format!("{:#}", e)))?;
        write_atomic(&layout.decoded_container(&stem, &ext), &decoded)?;

        self.ledger
            .update_status(&entry.id, LogStatus::ProcessingComplete)?;
        log::info!(
            "{} complete: {} frames, {:.3}s, {} continuation files",
            stem,
            session.samples,
            session.length_secs,
            segments
        );
        Ok(Outcome::Completed {
            id: entry.id.clone(),
            stem,
            samples: session.samples,
            segments,
        })
    }

    fn quarantine_file(&mut self, path: &Path) {
        self.quarantine.insert(path.to_path_buf(), modified_time(path));
    }

    fn is_quarantined(&mut self, path: &Path) -> bool {
        let Some(failed_at) = self.quarantine.get(path) else {
            return false;
        };
        if *failed_at == modified_time(path) {
            return true;
        }
        log::debug!("{} changed since it failed; retrying", path.display());
        self.quarantine.remove(path);
        false
    }
}

/// Archived continuations first, then whatever is still waiting in the input
/// directory.
struct ResumeSegments<'a> {
    archived: ArchivedSegments,
    live: InputDirSegments<'a>,
    from_archive: bool,
}

impl SegmentSource for ResumeSegments<'_> {
    fn next_segment(&mut self) -> Result<Option<PathBuf>> {
        if self.from_archive {
            if let Some(path) = self.archived.next_segment()? {
                return Ok(Some(path));
            }
            self.from_archive = false;
        }
        self.live.next_segment()
    }

    fn accept(&mut self, path: &Path, archived_as: &Path) -> Result<PathBuf> {
        if self.from_archive {
            self.archived.accept(path, archived_as)
        } else {
            self.live.accept(path, archived_as)
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn original_stem(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(250)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::NdjsonEncoder;
    use crate::frame::Frame;
    use crate::ingest::CONTINUATION_SENTINEL;
    use crate::ledger::InMemoryLedger;
    use crate::report::RecordingReporter;
    use std::fs;
    use tempfile::TempDir;

    const HEADER: &str = r#"{"unit_type": "MM430", "unit_number": "E1", "log_start_time": "2021-01-10T13:00:00Z", "log_type": "DAT"}"#;

    /// Fails the first `failures` encodes.
    struct FlakyEncoder {
        failures: std::cell::Cell<usize>,
    }

    impl SessionEncoder for FlakyEncoder {
        fn container_extension(&self) -> &str {
            "ndjson"
        }

        fn encode(&self, frames: &[Frame]) -> Result<Vec<u8>> {
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(anyhow!("codec unavailable"));
            }
            NdjsonEncoder.encode(frames)
        }

        fn extract(&self, raw: &[u8], dbc_files: &[PathBuf]) -> Result<Vec<u8>> {
            NdjsonEncoder.extract(raw, dbc_files)
        }
    }

    fn setup() -> (TempDir, PipelineSettings) {
        let tmp = TempDir::new().unwrap();
        let settings = PipelineSettings::under(tmp.path());
        fs::create_dir_all(&settings.input_dir).unwrap();
        fs::create_dir_all(&settings.dbc_dir).unwrap();
        (tmp, settings)
    }

    #[test]
    fn bad_header_is_quarantined_until_it_changes() -> Result<()> {
        let (_tmp, settings) = setup();
        let bad = settings.input_dir.join("a_bad.log");
        fs::write(&bad, "not a header\n0-1-100#01\n")?;
        fs::write(
            settings.input_dir.join("b_good.log"),
            format!("{}\n0-1-100#01\n", HEADER),
        )?;
        let mut orch = Orchestrator::new(
            settings.clone(),
            InMemoryLedger::new(),
            NdjsonEncoder,
            RecordingReporter::new(),
        );

        let summary = orch.run_once()?;
        assert_eq!((summary.completed, summary.failed), (1, 1));
        assert!(bad.exists());

        let summary = orch.run_once()?;
        assert!(summary.is_idle(), "quarantined file must not be retried");

        fs::write(&bad, format!("{}\n0-1-100#02\n", HEADER))?;
        let later = SystemTime::now() + Duration::from_secs(5);
        fs::File::options()
            .write(true)
            .open(&bad)?
            .set_modified(later)?;
        let summary = orch.run_once()?;
        assert_eq!(summary.completed, 1);
        assert!(!bad.exists());
        Ok(())
    }

    #[test]
    fn far_out_timestamp_does_not_stop_the_scan() -> Result<()> {
        let (_tmp, settings) = setup();
        let csv_header = HEADER.replace(r#""DAT""#, r#""CSV""#);
        fs::write(
            settings.input_dir.join("E1_a.log"),
            format!("{}\n1e15,1,0,100,1,01\n", csv_header),
        )?;
        fs::write(
            settings.input_dir.join("E1_b.log"),
            format!("{}\n0.5,1,0,100,1,02\n", csv_header),
        )?;
        let mut orch = Orchestrator::new(
            settings.clone(),
            InMemoryLedger::new(),
            NdjsonEncoder,
            RecordingReporter::new(),
        );
        let summary = orch.run_once()?;
        assert_eq!(
            (summary.zero_data, summary.completed, summary.failed),
            (1, 1, 0)
        );
        assert!(list_capture_files(&settings.input_dir)?.is_empty());
        Ok(())
    }

    #[test]
    fn failed_encode_is_resumed_from_archive() -> Result<()> {
        let (_tmp, settings) = setup();
        fs::write(
            settings.input_dir.join("E1_a.log"),
            format!("{}\n0-1-100#01\n2-1-100#02\n{}\n", HEADER, CONTINUATION_SENTINEL),
        )?;
        fs::write(
            settings.input_dir.join("E1_b.log"),
            format!(
                "{}\n1-1-100#03\n",
                HEADER.replace("13:00:00Z", "13:00:02Z")
            ),
        )?;
        let mut orch = Orchestrator::new(
            settings.clone(),
            InMemoryLedger::new(),
            FlakyEncoder {
                failures: std::cell::Cell::new(1),
            },
            RecordingReporter::new(),
        );

        let err = orch
            .process_file(&settings.input_dir.join("E1_a.log"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IngestError>(),
            Some(IngestError::Encode(_))
        ));
        let stuck = orch.ledger_mut().entries_with_status(LogStatus::LogFileMoved)?;
        assert_eq!(stuck.len(), 1);

        let summary = orch.resume_pending()?;
        assert_eq!(summary.completed, 1);
        let entry = orch.ledger_mut().get(&stuck[0].id)?.unwrap();
        assert_eq!(entry.status, LogStatus::ProcessingComplete);
        assert_eq!(entry.samples, Some(3));
        assert_eq!(entry.length_secs, Some(3.0));

        let layout = UnitLayout::new(&settings.output_dir, "MM430", "E1");
        let presence = layout.check_outputs("E1_00001", "ndjson");
        assert!(presence.decoded && presence.raw && presence.archived_log);
        Ok(())
    }

    #[test]
    fn upstream_entries_are_bound_and_combined() -> Result<()> {
        let (_tmp, settings) = setup();
        let mut ledger = InMemoryLedger::new();
        let start = chrono::Utc::now();
        for (id, name) in [("up-a", "E1_a.log"), ("up-b", "E1_b.log")] {
            ledger.create_with_id(
                id,
                crate::ledger::NewLogEntry {
                    unit_number: "E1",
                    start_time: start,
                    content_hash: None,
                    original_file_name: name,
                    status: LogStatus::Uploaded,
                },
            )?;
        }
        fs::write(
            settings.input_dir.join("E1_a.log"),
            format!("{}\n0-1-100#01\n{}\n", HEADER, CONTINUATION_SENTINEL),
        )?;
        fs::write(
            settings.input_dir.join("E1_b.log"),
            format!("{}\n0-1-100#02\n", HEADER),
        )?;
        let mut orch = Orchestrator::new(settings, ledger, NdjsonEncoder, RecordingReporter::new());
        let summary = orch.run_once()?;
        assert_eq!(summary.completed, 1);

        let ledger = orch.ledger_mut();
        let head = ledger.get("up-a")?.unwrap();
        assert_eq!(head.status, LogStatus::ProcessingComplete);
        assert_eq!(head.sequence, 1);
        assert!(head.content_hash.is_some());
        assert_eq!(
            ledger.get("up-b")?.unwrap().status,
            LogStatus::CombinedWithLaterLog
        );
        Ok(())
    }

    #[test]
    fn still_uploading_files_are_left_alone() -> Result<()> {
        let (_tmp, settings) = setup();
        let mut ledger = InMemoryLedger::new();
        ledger.create_with_id(
            "up",
            crate::ledger::NewLogEntry {
                unit_number: "E1",
                start_time: chrono::Utc::now(),
                content_hash: None,
                original_file_name: "E1_a.log",
                status: LogStatus::Uploading,
            },
        )?;
        let path = settings.input_dir.join("E1_a.log");
        fs::write(&path, format!("{}\n0-1-100#01\n", HEADER))?;
        let mut orch = Orchestrator::new(settings, ledger, NdjsonEncoder, RecordingReporter::new());
        assert_eq!(orch.process_file(&path)?, Outcome::StillUploading);
        let summary = orch.run_once()?;
        assert_eq!(summary.waiting, 1);
        assert!(summary.is_idle());
        assert!(path.exists());
        Ok(())
    }
}
