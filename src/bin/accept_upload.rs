//! accept_upload - hand a log file to the ingestion input directory the way an
//! upload endpoint does (staged write, rename, ledger entry)

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use canlog_ingest::{IngestConfig, SqliteLedger, UploadAcceptor};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Unit number the log came from.
    #[arg(long)]
    unit: String,
    /// Name the logger gave the file (defaults to the file's own name).
    #[arg(long)]
    log_name: Option<String>,
    /// Client-supplied upload id; a repeated id is refused.
    #[arg(long)]
    client_id: Option<String>,
    /// Log file to accept.
    path: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = IngestConfig::load()?;
    cfg.ensure_dirs()?;

    let log_name = match args.log_name {
        Some(name) => name,
        None => args
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("{} has no file name", args.path.display()))?,
    };
    let client_id = args
        .client_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let bytes = std::fs::read(&args.path)
        .map_err(|e| anyhow!("failed to read {}: {}", args.path.display(), e))?;

    let mut ledger = SqliteLedger::open(&cfg.db_path)?;
    let acceptor = UploadAcceptor::new(&cfg.input_dir());
    let entry = acceptor.accept(&mut ledger, &client_id, &args.unit, &log_name, &bytes)?;
    println!("{} {}", entry.id, entry.original_file_name);
    Ok(())
}
