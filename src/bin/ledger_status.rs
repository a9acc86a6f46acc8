//! ledger_status - list a unit's log entries and which artifacts exist

use anyhow::{anyhow, Result};
use clap::Parser;

use canlog_ingest::{IngestConfig, Ledger, LogEntry, LogStatus, SqliteLedger, UnitLayout};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Ledger database (defaults to the configured one).
    #[arg(long, env = "CANLOG_DB_PATH")]
    db_path: Option<String>,
    /// Unit whose entries are listed.
    #[arg(long, conflicts_with = "status")]
    unit: Option<String>,
    /// List every entry with this status (e.g. "LOG file Moved").
    #[arg(long)]
    status: Option<String>,
    /// Container extension used when checking artifacts.
    #[arg(long, default_value = "ndjson")]
    ext: String,
    /// Print entries as JSON lines.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let cfg = IngestConfig::load()?;
    let db_path = args.db_path.unwrap_or_else(|| cfg.db_path.clone());
    let mut ledger = SqliteLedger::open(&db_path)?;

    let entries = match (&args.unit, &args.status) {
        (Some(unit), _) => ledger.entries_for_unit(unit)?,
        (None, Some(status)) => ledger.entries_with_status(status.parse::<LogStatus>()?)?,
        (None, None) => return Err(anyhow!("pass --unit or --status")),
    };

    for entry in &entries {
        if args.json {
            println!("{}", serde_json::to_string(entry)?);
        } else {
            let artifacts = artifact_flags(&mut ledger, &cfg, entry, &args.ext)?;
            println!(
                "{:<16} {:<24} {:<26} {:>10} {:>9} {} {}",
                entry.file_stem(),
                entry.status.as_str(),
                entry.start_time.to_rfc3339(),
                entry
                    .length_secs
                    .map(|secs| format!("{:.3}s", secs))
                    .unwrap_or_else(|| "-".to_string()),
                entry
                    .samples
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                artifacts,
                entry.original_file_name
            );
        }
    }
    if !args.json {
        eprintln!("{} entries", entries.len());
    }
    Ok(())
}

/// `DRL` for decoded container, raw container and archived log; `-` where absent.
fn artifact_flags(
    ledger: &mut SqliteLedger,
    cfg: &IngestConfig,
    entry: &LogEntry,
    ext: &str,
) -> Result<String> {
    let Some(vehicle) = ledger.vehicle(&entry.unit_number)? else {
        return Ok("???".to_string());
    };
    let layout = UnitLayout::new(&cfg.output_dir(), &vehicle.vehicle_type, &entry.unit_number);
    let presence = layout.check_outputs(&entry.file_stem(), ext);
    Ok([
        (presence.decoded, 'D'),
        (presence.raw, 'R'),
        (presence.archived_log, 'L'),
    ]
    .iter()
    .map(|(present, flag)| if *present { *flag } else { '-' })
    .collect())
}
