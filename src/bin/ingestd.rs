//! ingestd - CAN capture ingestion daemon
//!
//! This daemon:
//! 1. Loads configuration (`CANLOG_CONFIG` file + `CANLOG_*` overrides)
//! 2. Opens the SQLite ledger
//! 3. Optionally finishes entries left at "LOG file Moved" by an earlier run
//! 4. Polls `<data_dir>/in_logs` and takes each capture file through
//!    decode, dedup, registration, archival, stitching and encoding
//! 5. Stops cleanly on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use canlog_ingest::ui::{Ui, UiMode};
use canlog_ingest::{IngestConfig, LogReporter, NdjsonEncoder, Orchestrator, SqliteLedger};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Process what is in the input directory once, then exit.
    #[arg(long)]
    once: bool,
    /// Finish entries stuck at "LOG file Moved" before scanning.
    #[arg(long)]
    resume: bool,
    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value_t = UiMode::Auto, value_name = "MODE")]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::new(args.ui);

    let cfg = IngestConfig::load()?;
    cfg.ensure_dirs()?;
    log::info!(
        "ingestd {} data_dir={} db={}",
        env!("CARGO_PKG_VERSION"),
        cfg.data_dir.display(),
        cfg.db_path
    );

    let ledger = {
        let _stage = ui.stage("opening ledger");
        SqliteLedger::open(&cfg.db_path)?
    };
    let mut orchestrator =
        Orchestrator::new(cfg.pipeline_settings(), ledger, NdjsonEncoder, LogReporter);

    if args.resume {
        let mut stage = ui.stage("resuming pending entries");
        let summary = orchestrator.resume_pending()?;
        stage.set_detail(format!(
            "{} complete, {} zero data, {} failed",
            summary.completed, summary.zero_data, summary.failed
        ));
    }

    if args.once {
        let mut stage = ui.stage("scanning input directory");
        let summary = orchestrator.run_once()?;
        stage.set_detail(format!(
            "{} complete, {} zero data, {} duplicate, {} waiting, {} failed",
            summary.completed,
            summary.zero_data,
            summary.duplicates,
            summary.waiting,
            summary.failed
        ));
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    orchestrator.run(&shutdown)
}
