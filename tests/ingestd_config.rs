use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use canlog_ingest::config::IngestConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CANLOG_CONFIG",
        "CANLOG_DATA_DIR",
        "CANLOG_DB_PATH",
        "CANLOG_POLL_SECS",
        "CANLOG_MAX_CHAIN",
        "CANLOG_SUCCESSOR_WAIT_SECS",
        "CANLOG_GAP_WARN_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_follow_standard_layout() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = IngestConfig::load().expect("load config");
    assert_eq!(cfg.data_dir, std::path::PathBuf::from("./can_data"));
    assert!(cfg.db_path.ends_with("logserver_db.sqlite3"));
    assert_eq!(cfg.poll_interval, Duration::from_secs(120));
    assert_eq!(cfg.stitch.max_chain_len, 100);
    assert_eq!(cfg.stitch.gap_warning_secs, 10.0);
    assert_eq!(cfg.successor_wait, Duration::from_secs(30));
    assert!(cfg.input_dir().ends_with("in_logs"));
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "data_dir": "/srv/can",
        "poll": { "interval_secs": 15 },
        "stitch": { "max_chain_len": 20, "gap_warning_secs": 2.5, "successor_wait_secs": 0 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CANLOG_CONFIG", file.path());
    std::env::set_var("CANLOG_POLL_SECS", "60");
    std::env::set_var("CANLOG_DB_PATH", "/var/lib/can/ledger.sqlite3");

    let cfg = IngestConfig::load().expect("load config");
    assert_eq!(cfg.data_dir, std::path::PathBuf::from("/srv/can"));
    assert_eq!(cfg.db_path, "/var/lib/can/ledger.sqlite3");
    assert_eq!(cfg.poll_interval, Duration::from_secs(60));
    assert_eq!(cfg.stitch.max_chain_len, 20);
    assert_eq!(cfg.stitch.gap_warning_secs, 2.5);
    assert_eq!(cfg.successor_wait, Duration::ZERO);
    let settings = cfg.pipeline_settings();
    assert_eq!(settings.output_dir, std::path::PathBuf::from("/srv/can/out"));

    clear_env();
}

#[test]
fn loads_toml_config_and_moves_default_db_with_data_dir() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = "[stitch]\nmax_chain_len = 5\n";
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("CANLOG_CONFIG", file.path());
    std::env::set_var("CANLOG_DATA_DIR", "/data/can");

    let cfg = IngestConfig::load().expect("load config");
    assert_eq!(cfg.stitch.max_chain_len, 5);
    assert_eq!(cfg.data_dir, std::path::PathBuf::from("/data/can"));
    assert_eq!(
        std::path::PathBuf::from(&cfg.db_path),
        std::path::PathBuf::from("/data/can/logserver_db.sqlite3")
    );

    clear_env();
}

#[test]
fn rejects_bad_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CANLOG_POLL_SECS", "soon");
    assert!(IngestConfig::load().is_err());
    clear_env();

    std::env::set_var("CANLOG_MAX_CHAIN", "0");
    assert!(IngestConfig::load().is_err());
    clear_env();

    std::env::set_var("CANLOG_CONFIG", "/nonexistent/canlog.json");
    assert!(IngestConfig::load().is_err());
    clear_env();
}
