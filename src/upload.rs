//! Upload acceptance.
//!
//! An upload is written under `in_logs/uploading/` and renamed into `in_logs/`
//! only once complete, so the scanner never sees a partial file. The ledger
//! entry is created first in `Uploading` and advanced to `Uploaded` after the
//! rename; the scanner skips files whose entry is still `Uploading`.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};

use crate::archive::{relocate, write_atomic};
use crate::error::IngestError;
use crate::ingest::validate_unit_component;
use crate::ledger::{Ledger, LogEntry, LogStatus, NewLogEntry};

pub const STAGING_DIR: &str = "uploading";

#[derive(Clone, Debug)]
pub struct UploadAcceptor {
    input_dir: PathBuf,
}

impl UploadAcceptor {
    pub fn new(input_dir: &Path) -> Self {
        Self {
            input_dir: input_dir.to_path_buf(),
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.input_dir.join(STAGING_DIR)
    }

    /// Input file name an upload is stored under.
    pub fn input_name(unit_number: &str, log_name: &str) -> String {
        format!("{}_{}", unit_number, log_name)
    }

    /// Accept one uploaded log. `client_id` makes the upload idempotent: a
    /// repeated id is refused with `AlreadyAccepted`.
    pub fn accept(
        &self,
        ledger: &mut dyn Ledger,
        client_id: &str,
        unit_number: &str,
        log_name: &str,
        bytes: &[u8],
    ) -> Result<LogEntry> {
        validate_unit_component(unit_number).map_err(|e| anyhow!("unit number {}", e))?;
        validate_unit_component(log_name).map_err(|e| anyhow!("log name {}", e))?;
        if ledger.get(client_id)?.is_some() {
            return Err(IngestError::AlreadyAccepted(client_id.to_string()).into());
        }

        let name = Self::input_name(unit_number, log_name);
        let destination = self.input_dir.join(&name);
        if destination.exists() {
            return Err(anyhow!("{} is already waiting to be processed", name));
        }

        let entry = ledger.create_with_id(
            client_id,
            NewLogEntry {
                unit_number,
                start_time: Utc::now(),
                content_hash: None,
                original_file_name: &name,
                status: LogStatus::Uploading,
            },
        )?;

        let staging = self.staging_dir();
        std::fs::create_dir_all(&staging)?;
        let staged = staging.join(&name);
        write_atomic(&staged, bytes)?;
        relocate(&staged, &destination)?;
        ledger.update_status(&entry.id, LogStatus::Uploaded)?;
        log::info!(
            "accepted {} ({} bytes) for unit {} as {}",
            log_name,
            bytes.len(),
            unit_number,
            name
        );

        Ok(LogEntry {
            status: LogStatus::Uploaded,
            ..entry
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use tempfile::TempDir;

    #[test]
    fn accepted_upload_lands_in_input_dir() -> Result<()> {
        let dir = TempDir::new()?;
        let acceptor = UploadAcceptor::new(dir.path());
        let mut ledger = InMemoryLedger::new();
        let entry = acceptor.accept(&mut ledger, "client-1", "E1", "0001.LOG", b"data")?;
        assert_eq!(entry.status, LogStatus::Uploaded);
        assert_eq!(entry.original_file_name, "E1_0001.LOG");
        assert_eq!(std::fs::read(dir.path().join("E1_0001.LOG"))?, b"data");
        assert!(!acceptor.staging_dir().join("E1_0001.LOG").exists());
        assert_eq!(ledger.get("client-1")?.unwrap().status, LogStatus::Uploaded);
        Ok(())
    }

    #[test]
    fn repeated_client_id_is_refused() -> Result<()> {
        let dir = TempDir::new()?;
        let acceptor = UploadAcceptor::new(dir.path());
        let mut ledger = InMemoryLedger::new();
        acceptor.accept(&mut ledger, "client-1", "E1", "0001.LOG", b"data")?;
        let err = acceptor
            .accept(&mut ledger, "client-1", "E1", "0002.LOG", b"data")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IngestError>(),
            Some(IngestError::AlreadyAccepted(_))
        ));
        assert!(!dir.path().join("E1_0002.LOG").exists());
        Ok(())
    }

    #[test]
    fn unsafe_names_are_refused() {
        let dir = TempDir::new().unwrap();
        let acceptor = UploadAcceptor::new(dir.path());
        let mut ledger = InMemoryLedger::new();
        assert!(acceptor
            .accept(&mut ledger, "c", "../E1", "a.log", b"")
            .is_err());
        assert!(acceptor
            .accept(&mut ledger, "c", "E1", "sub/a.log", b"")
            .is_err());
    }
}
