use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::PipelineSettings;
use crate::stitch::{StitchOptions, DEFAULT_GAP_WARNING_SECS, DEFAULT_MAX_CHAIN_LEN};

const DEFAULT_DATA_DIR: &str = "./can_data";
const DEFAULT_DB_FILE: &str = "logserver_db.sqlite3";
const DEFAULT_POLL_SECS: u64 = 120;
const DEFAULT_SUCCESSOR_WAIT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    data_dir: Option<PathBuf>,
    db_path: Option<String>,
    poll: Option<PollConfigFile>,
    stitch: Option<StitchConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PollConfigFile {
    interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StitchConfigFile {
    max_chain_len: Option<usize>,
    gap_warning_secs: Option<f64>,
    successor_wait_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub data_dir: PathBuf,
    pub db_path: String,
    pub poll_interval: Duration,
    pub stitch: StitchOptions,
    pub successor_wait: Duration,
}

impl IngestConfig {
    /// Defaults, then the file named by `CANLOG_CONFIG`, then `CANLOG_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CANLOG_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: IngestConfigFile) -> Self {
        let data_dir = file
            .data_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let db_path = file
            .db_path
            .unwrap_or_else(|| data_dir.join(DEFAULT_DB_FILE).display().to_string());
        let poll_interval = Duration::from_secs(
            file.poll
                .and_then(|poll| poll.interval_secs)
                .unwrap_or(DEFAULT_POLL_SECS),
        );
        let stitch = StitchOptions {
            max_chain_len: file
                .stitch
                .as_ref()
                .and_then(|stitch| stitch.max_chain_len)
                .unwrap_or(DEFAULT_MAX_CHAIN_LEN),
            gap_warning_secs: file
                .stitch
                .as_ref()
                .and_then(|stitch| stitch.gap_warning_secs)
                .unwrap_or(DEFAULT_GAP_WARNING_SECS),
        };
        let successor_wait = Duration::from_secs(
            file.stitch
                .and_then(|stitch| stitch.successor_wait_secs)
                .unwrap_or(DEFAULT_SUCCESSOR_WAIT_SECS),
        );
        Self {
            data_dir,
            db_path,
            poll_interval,
            stitch,
            successor_wait,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("CANLOG_DATA_DIR") {
            if !dir.trim().is_empty() {
                let default_db = self.data_dir.join(DEFAULT_DB_FILE).display().to_string();
                if self.db_path == default_db {
                    self.db_path = Path::new(&dir).join(DEFAULT_DB_FILE).display().to_string();
                }
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("CANLOG_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(secs) = std::env::var("CANLOG_POLL_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| anyhow!("CANLOG_POLL_SECS must be an integer number of seconds"))?;
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Ok(max) = std::env::var("CANLOG_MAX_CHAIN") {
            self.stitch.max_chain_len = max
                .parse()
                .map_err(|_| anyhow!("CANLOG_MAX_CHAIN must be a positive integer"))?;
        }
        if let Ok(secs) = std::env::var("CANLOG_SUCCESSOR_WAIT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("CANLOG_SUCCESSOR_WAIT_SECS must be an integer number of seconds")
            })?;
            self.successor_wait = Duration::from_secs(secs);
        }
        if let Ok(secs) = std::env::var("CANLOG_GAP_WARN_SECS") {
            self.stitch.gap_warning_secs = secs
                .parse()
                .map_err(|_| anyhow!("CANLOG_GAP_WARN_SECS must be a number of seconds"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval.as_secs() == 0 {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        if self.stitch.max_chain_len == 0 {
            return Err(anyhow!("max chain length must be at least 1"));
        }
        if !self.stitch.gap_warning_secs.is_finite() || self.stitch.gap_warning_secs < 0.0 {
            return Err(anyhow!("gap warning threshold must be a non-negative number"));
        }
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        Ok(())
    }

    pub fn input_dir(&self) -> PathBuf {
        self.data_dir.join("in_logs")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("out")
    }

    pub fn dbc_dir(&self) -> PathBuf {
        self.data_dir.join("dbc")
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            input_dir: self.input_dir(),
            output_dir: self.output_dir(),
            dbc_dir: self.dbc_dir(),
            stitch: self.stitch.clone(),
            successor_wait: self.successor_wait,
            poll_interval: self.poll_interval,
        }
    }

    /// Create the data directory tree if it does not exist yet.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.input_dir(),
            self.input_dir().join(crate::upload::STAGING_DIR),
            self.output_dir(),
            self.dbc_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| anyhow!("failed to create {}: {}", dir.display(), e))?;
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<IngestConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
