use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tempfile::TempDir;

use canlog_ingest::ledger::NewLogEntry;
use canlog_ingest::{
    Frame, IngestError, Ledger, LogStatus, NdjsonEncoder, Orchestrator, Outcome,
    PipelineSettings, RecordingReporter, SessionEncoder, SqliteLedger, UnitLayout,
    UploadAcceptor, CONTINUATION_SENTINEL,
};

const START: &str = "2021-01-10T13:53:33.993Z";

fn header(unit: &str, start: &str) -> String {
    format!(
        r#"{{"unit_type": "MM430", "unit_number": "{}", "log_start_time": "{}", "log_type": "CSV"}}"#,
        unit, start
    )
}

fn write_log(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, lines.join("\n") + "\n").unwrap();
    path
}

/// Counts encode calls and delegates to the reference encoder.
#[derive(Clone, Default)]
struct CountingEncoder {
    calls: Arc<AtomicUsize>,
}

impl SessionEncoder for CountingEncoder {
    fn container_extension(&self) -> &str {
        "ndjson"
    }

    fn encode(&self, frames: &[Frame]) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        NdjsonEncoder.encode(frames)
    }

    fn extract(&self, raw: &[u8], dbc_files: &[PathBuf]) -> Result<Vec<u8>> {
        NdjsonEncoder.extract(raw, dbc_files)
    }
}

struct BrokenEncoder;

impl SessionEncoder for BrokenEncoder {
    fn container_extension(&self) -> &str {
        "mf4"
    }

    fn encode(&self, _frames: &[Frame]) -> Result<Vec<u8>> {
        Err(anyhow!("codec crashed"))
    }

    fn extract(&self, _raw: &[u8], _dbc_files: &[PathBuf]) -> Result<Vec<u8>> {
        Err(anyhow!("codec crashed"))
    }
}

struct Env {
    tmp: TempDir,
    settings: PipelineSettings,
}

impl Env {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let settings = PipelineSettings::under(tmp.path());
        fs::create_dir_all(&settings.input_dir).unwrap();
        fs::create_dir_all(settings.dbc_dir.join("MM430")).unwrap();
        fs::write(settings.dbc_dir.join("MM430/engine.dbc"), "VERSION \"\"\n").unwrap();
        Self { tmp, settings }
    }

    fn ledger(&self) -> SqliteLedger {
        let db = self.tmp.path().join("ledger.sqlite3");
        SqliteLedger::open(db.to_str().unwrap()).unwrap()
    }

    fn orchestrator<E: SessionEncoder>(
        &self,
        encoder: E,
    ) -> Orchestrator<SqliteLedger, E, RecordingReporter> {
        Orchestrator::new(
            self.settings.clone(),
            self.ledger(),
            encoder,
            RecordingReporter::new(),
        )
    }

    fn layout(&self, unit: &str) -> UnitLayout {
        UnitLayout::new(&self.settings.output_dir, "MM430", unit)
    }
}

#[test]
fn dedup_is_per_unit() -> Result<()> {
    let env = Env::new();
    let rows = ["0.000,1,0,1A0,8,01,02,03,04,05,06,07,08", "0.100,1,0,1A0,8,01,02,03,04,05,06,07,09"];
    let e1 = header("E1", START);
    let e2 = header("E2", START);
    let first = write_log(&env.settings.input_dir, "E1_0001.log", &[&e1, rows[0], rows[1]]);
    let again = write_log(&env.settings.input_dir, "E1_0002.log", &[&e1, rows[0], rows[1]]);
    let other = write_log(&env.settings.input_dir, "E2_0001.log", &[&e2, rows[0], rows[1]]);

    let mut orch = env.orchestrator(CountingEncoder::default());
    let completed = orch.process_file(&first)?;
    let duplicate = orch.process_file(&again)?;
    let other_unit = orch.process_file(&other)?;

    let Outcome::Completed { id, stem, .. } = completed else {
        panic!("expected completion, got {:?}", completed);
    };
    assert_eq!(stem, "E1_00001");
    match duplicate {
        Outcome::Duplicate {
            existing_id,
            archived_as,
        } => {
            assert_eq!(existing_id, id);
            assert_eq!(
                archived_as,
                env.layout("E1").processed_dir().join("E1_0002_duplicate.log")
            );
            assert!(archived_as.exists());
        }
        other => panic!("expected duplicate, got {:?}", other),
    }
    assert!(matches!(other_unit, Outcome::Completed { ref stem, .. } if stem == "E2_00001"));

    let ledger = orch.ledger_mut();
    assert_eq!(ledger.entries_for_unit("E1")?.len(), 1);
    assert_eq!(ledger.entries_for_unit("E2")?.len(), 1);
    assert!(fs::read_dir(&env.settings.input_dir)?
        .filter_map(|e| e.ok())
        .all(|e| e.path().is_dir()));
    Ok(())
}

#[test]
fn sequences_increase_without_gaps() -> Result<()> {
    let env = Env::new();
    let e1 = header("E1", START);
    for n in 0..3 {
        let row = format!("0.0,1,0,100,1,{:02X}", n);
        write_log(
            &env.settings.input_dir,
            &format!("E1_{:04}.log", n),
            &[&e1, &row],
        );
    }
    let mut orch = env.orchestrator(NdjsonEncoder);
    let summary = orch.run_once()?;
    assert_eq!(summary.completed, 3);

    let entries = orch.ledger_mut().entries_for_unit("E1")?;
    let sequences: Vec<u32> = entries.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    for entry in &entries {
        assert_eq!(entry.status, LogStatus::ProcessingComplete);
        let presence = env.layout("E1").check_outputs(&entry.file_stem(), "ndjson");
        assert!(presence.decoded && presence.raw && presence.archived_log);
    }
    Ok(())
}

#[test]
fn header_and_sentinel_only_is_zero_data_without_encoding() -> Result<()> {
    let env = Env::new();
    write_log(
        &env.settings.input_dir,
        "E1_0001.log",
        &[&header("E1", START), CONTINUATION_SENTINEL],
    );
    write_log(&env.settings.input_dir, "E2_0001.log", &[&header("E2", START)]);

    let encoder = CountingEncoder::default();
    let calls = Arc::clone(&encoder.calls);
    let mut orch = env.orchestrator(encoder);
    let summary = orch.run_once()?;
    assert_eq!(summary.zero_data, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    for unit in ["E1", "E2"] {
        let entries = orch.ledger_mut().entries_for_unit(unit)?;
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.status, LogStatus::ZeroData);
        assert_eq!(entry.samples, Some(0));
        assert_eq!(entry.length_secs, Some(0.0));
        assert_eq!(entry.end_time, Some(entry.start_time));
        let presence = env.layout(unit).check_outputs(&entry.file_stem(), "ndjson");
        assert!(presence.archived_log);
        assert!(!presence.raw && !presence.decoded);
    }
    Ok(())
}

#[test]
fn continuation_files_merge_into_one_entry() -> Result<()> {
    let env = Env::new();
    write_log(
        &env.settings.input_dir,
        "E1_0001.log",
        &[
            &header("E1", "2021-01-10T13:00:00Z"),
            "0,1,0,100,1,01",
            "1,1,0,100,1,02",
            "5,1,0,100,1,03",
            CONTINUATION_SENTINEL,
        ],
    );
    write_log(
        &env.settings.input_dir,
        "E1_0002.log",
        &[
            &header("E1", "2021-01-10T13:00:05Z"),
            "0,1,0,100,1,04",
            "3,1,0,100,1,05",
        ],
    );
    let mut orch = env.orchestrator(NdjsonEncoder);
    let summary = orch.run_once()?;
    assert_eq!(summary.completed, 1);

    let entries = orch.ledger_mut().entries_for_unit("E1")?;
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.samples, Some(5));
    assert_eq!(entry.length_secs, Some(8.0));
    assert_eq!(
        entry.end_time,
        Some("2021-01-10T13:00:08Z".parse().unwrap())
    );

    let layout = env.layout("E1");
    assert!(layout.continuation_log("E1_00001", 1).exists());
    let raw = fs::read_to_string(layout.raw_container("E1_00001", "ndjson"))?;
    let stamps: Vec<f64> = raw
        .lines()
        .map(|line| serde_json::from_str::<Frame>(line).map(|f| f.timestamp))
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(stamps, vec![0.0, 1.0, 5.0, 5.0, 8.0]);

    let decoded = fs::read_to_string(layout.decoded_container("E1_00001", "ndjson"))?;
    assert!(decoded.lines().next().unwrap_or_default().contains("engine.dbc"));
    Ok(())
}

#[test]
fn encoder_failure_leaves_entry_at_log_file_moved() -> Result<()> {
    let env = Env::new();
    let path = write_log(
        &env.settings.input_dir,
        "E1_0001.log",
        &[&header("E1", START), "0,1,0,100,1,01"],
    );
    let mut orch = env.orchestrator(BrokenEncoder);
    let err = orch.process_file(&path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IngestError>(),
        Some(IngestError::Encode(_))
    ));
    let entries = orch.ledger_mut().entries_for_unit("E1")?;
    assert_eq!(entries[0].status, LogStatus::LogFileMoved);
    assert!(env.layout("E1").archived_log("E1_00001").exists());
    assert!(!path.exists());
    Ok(())
}

#[test]
fn bad_header_does_not_stop_the_scan() -> Result<()> {
    let env = Env::new();
    let bad = write_log(&env.settings.input_dir, "A_broken.log", &["{not json", "0,1,0,100,1,01"]);
    write_log(
        &env.settings.input_dir,
        "B_fine.log",
        &[&header("E1", START), "0,1,0,100,1,01"],
    );
    let mut orch = env.orchestrator(NdjsonEncoder);
    let summary = orch.run_once()?;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 1);
    assert!(bad.exists());
    Ok(())
}

#[test]
fn uploaded_file_keeps_its_upload_entry() -> Result<()> {
    let env = Env::new();
    let body = [header("E1", START), "0,1,0,7DF,2,AB,CD".to_string()].join("\n");
    let acceptor = UploadAcceptor::new(&env.settings.input_dir);
    let mut ledger = env.ledger();
    let accepted = acceptor.accept(&mut ledger, "upload-1", "E1", "00000001.LOG", body.as_bytes())?;
    assert_eq!(accepted.status, LogStatus::Uploaded);
    drop(ledger);

    let mut orch = env.orchestrator(NdjsonEncoder);
    let summary = orch.run_once()?;
    assert_eq!(summary.completed, 1);

    let entry = orch.ledger_mut().get("upload-1")?.expect("upload entry");
    assert_eq!(entry.status, LogStatus::ProcessingComplete);
    assert_eq!(entry.sequence, 1);
    assert_eq!(entry.samples, Some(1));
    assert_eq!(entry.start_time, START.parse::<chrono::DateTime<chrono::Utc>>()?);
    assert_eq!(orch.ledger_mut().entries_for_unit("E1")?.len(), 1);

    let raw = fs::read_to_string(env.layout("E1").raw_container("E1_00001", "ndjson"))?;
    let frame: Frame = serde_json::from_str(raw.lines().next().unwrap_or_default())?;
    assert_eq!(frame.arbitration_id, 0x7DF);
    assert_eq!(frame.payload(), &[0xAB, 0xCD]);
    Ok(())
}

#[test]
fn continuation_chain_uploaded_twice_is_one_session() -> Result<()> {
    let env = Env::new();
    let first = [
        header("E1", "2021-01-10T13:00:00Z"),
        "0,1,0,100,1,01".to_string(),
        "2,1,0,100,1,02".to_string(),
        CONTINUATION_SENTINEL.to_string(),
    ]
    .join("\n");
    let second = [
        header("E1", "2021-01-10T13:00:02Z"),
        "0,1,0,100,1,03".to_string(),
        "1,1,0,100,1,04".to_string(),
    ]
    .join("\n");
    let acceptor = UploadAcceptor::new(&env.settings.input_dir);
    let mut ledger = env.ledger();
    for (client_id, log_name, body) in [
        ("up-0a", "0a.log", &first),
        ("up-0b", "0b.log", &second),
        ("up-1a", "1a.log", &first),
        ("up-1b", "1b.log", &second),
    ] {
        acceptor.accept(&mut ledger, client_id, "E1", log_name, body.as_bytes())?;
    }
    drop(ledger);

    let mut orch = env.orchestrator(NdjsonEncoder);
    let summary = orch.run_once()?;
    assert_eq!(
        (summary.completed, summary.duplicates, summary.failed),
        (1, 1, 0)
    );
    assert!(orch.run_once()?.is_idle());

    let ledger = orch.ledger_mut();
    let complete: Vec<_> = ledger
        .entries_for_unit("E1")?
        .into_iter()
        .filter(|entry| entry.status == LogStatus::ProcessingComplete)
        .collect();
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].id, "up-0a");
    assert_eq!(complete[0].samples, Some(4));
    for (id, status) in [
        ("up-0b", LogStatus::CombinedWithLaterLog),
        ("up-1a", LogStatus::Duplicate),
        ("up-1b", LogStatus::Duplicate),
    ] {
        assert_eq!(ledger.get(id)?.map(|entry| entry.status), Some(status), "{}", id);
    }

    let processed = env.layout("E1").processed_dir();
    assert!(processed.join("E1_1a_duplicate.log").exists());
    assert!(processed.join("E1_1a_duplicate_cont01.log").exists());
    assert!(fs::read_dir(&env.settings.input_dir)?
        .filter_map(|e| e.ok())
        .all(|e| e.path().is_dir()));
    Ok(())
}

#[test]
fn files_archived_before_their_status_change_are_resumed() -> Result<()> {
    let env = Env::new();
    let layout = env.layout("E1");
    layout.create_dirs()?;
    let start = "2021-01-10T13:00:00Z".parse::<chrono::DateTime<chrono::Utc>>()?;

    let mut ledger = env.ledger();
    ledger.ensure_vehicle("E1", "MM430")?;
    let head = ledger.create("E1", start, "0000", "E1_0001.log")?;
    ledger.create_with_id(
        "up-seg",
        NewLogEntry {
            unit_number: "E1",
            start_time: start,
            content_hash: None,
            original_file_name: "E1_0002.log",
            status: LogStatus::Uploaded,
        },
    )?;
    drop(ledger);

    // The run stopped right after both files were moved.
    let stem = head.file_stem();
    write_log(
        &layout.processed_dir(),
        &format!("{}.log", stem),
        &[
            &header("E1", "2021-01-10T13:00:00Z"),
            "0,1,0,100,1,01",
            "2,1,0,100,1,02",
            CONTINUATION_SENTINEL,
        ],
    );
    write_log(
        &layout.processed_dir(),
        &format!("{}_cont01.log", stem),
        &[
            &header("E1", "2021-01-10T13:00:02Z"),
            "0,1,0,100,1,03",
            "1,1,0,100,1,04",
        ],
    );

    let mut orch = env.orchestrator(NdjsonEncoder);
    let summary = orch.resume_pending()?;
    assert_eq!((summary.completed, summary.failed), (1, 0));

    let ledger = orch.ledger_mut();
    let entry = ledger.get(&head.id)?.expect("head entry");
    assert_eq!(entry.status, LogStatus::ProcessingComplete);
    assert_eq!(entry.samples, Some(4));
    assert_eq!(entry.length_secs, Some(3.0));
    assert_eq!(
        ledger.get("up-seg")?.map(|entry| entry.status),
        Some(LogStatus::CombinedWithLaterLog)
    );
    assert!(layout.check_outputs(&stem, "ndjson").decoded);
    Ok(())
}
