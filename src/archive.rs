//! Unit-scoped output layout and crash-safe file relocation.
//!
//! Layout under the output root:
//!
//! ```text
//! <unit_type>/<unit_number>/<stem>.<ext>                     decoded container
//! <unit_type>/<unit_number>/raw_logs/raw-<stem>.<ext>        raw container
//! <unit_type>/<unit_number>/in_logs_processed/<stem>.log     archived head file
//! <unit_type>/<unit_number>/in_logs_processed/<stem>_cont01.log ...
//! ```
//!
//! `relocate` returns only once the destination directory entry is durable, so
//! ledger status can be advanced right after it.

use anyhow::{anyhow, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::IngestError;

pub const PROCESSED_DIR: &str = "in_logs_processed";
pub const RAW_DIR: &str = "raw_logs";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitLayout {
    root: PathBuf,
}

/// Which per-session artifacts are present on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputPresence {
    pub decoded: bool,
    pub raw: bool,
    pub archived_log: bool,
}

impl UnitLayout {
    pub fn new(output_root: &Path, unit_type: &str, unit_number: &str) -> Self {
        Self {
            root: output_root.join(unit_type).join(unit_number),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join(PROCESSED_DIR)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join(RAW_DIR)
    }

    pub fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.processed_dir())?;
        fs::create_dir_all(self.raw_dir())?;
        Ok(())
    }

    pub fn archived_log(&self, stem: &str) -> PathBuf {
        self.processed_dir().join(format!("{}.log", stem))
    }

    /// `index` starts at 1.
    pub fn continuation_log(&self, stem: &str, index: usize) -> PathBuf {
        self.processed_dir()
            .join(format!("{}_cont{:02}.log", stem, index))
    }

    /// First free `<stem>_duplicate.log`, `<stem>_duplicate2.log`, ...
    pub fn duplicate_log(&self, stem: &str) -> PathBuf {
        let dir = self.processed_dir();
        let first = dir.join(format!("{}_duplicate.log", stem));
        if !first.exists() {
            return first;
        }
        (2usize..)
            .map(|n| dir.join(format!("{}_duplicate{}.log", stem, n)))
            .find(|candidate| !candidate.exists())
            .unwrap_or(first)
    }

    /// Whether a file named `<stem>.log` was ever set aside as a duplicate.
    pub fn has_duplicate_of(&self, stem: &str) -> bool {
        self.processed_dir()
            .join(format!("{}_duplicate.log", stem))
            .exists()
    }

    /// Whether any session of this unit has archived continuation segments.
    pub fn has_continuations(&self) -> Result<bool> {
        let dir = self.processed_dir();
        if !dir.exists() {
            return Ok(false);
        }
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let is_continuation = name
                .strip_suffix(".log")
                .and_then(|base| base.rsplit_once("_cont"))
                .map_or(false, |(_, digits)| {
                    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
                });
            if is_continuation {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn raw_container(&self, stem: &str, ext: &str) -> PathBuf {
        self.raw_dir().join(format!("raw-{}.{}", stem, ext))
    }

    pub fn decoded_container(&self, stem: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{}.{}", stem, ext))
    }

    /// Archived continuation segments of `stem`, in chain order.
    pub fn archived_continuations(&self, stem: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}_cont", stem);
        let dir = self.processed_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut found: Vec<(usize, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let index = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".log"))
                .and_then(|digits| digits.parse::<usize>().ok());
            if let Some(index) = index {
                found.push((index, entry.path()));
            }
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    pub fn check_outputs(&self, stem: &str, ext: &str) -> OutputPresence {
        OutputPresence {
            decoded: self.decoded_container(stem, ext).is_file(),
            raw: self.raw_container(stem, ext).is_file(),
            archived_log: self.archived_log(stem).is_file(),
        }
    }
}

/// Move `src` to `dst` without ever losing or duplicating the file.
///
/// Same volume: one `rename`. Otherwise: copy to a temp file beside `dst`, fsync,
/// rename into place, then delete `src`. If an earlier run crashed after the
/// rename but before deleting `src`, the identical copy at `dst` is accepted and
/// `src` removed. A different file already at `dst` is an `ArchiveConflict`.
pub fn relocate(src: &Path, dst: &Path) -> Result<()> {
    let parent = dst
        .parent()
        .ok_or_else(|| anyhow!("archive destination {} has no parent", dst.display()))?;
    fs::create_dir_all(parent)?;

    if dst.exists() {
        if src.exists() && same_contents(src, dst)? {
            log::warn!(
                "{} already archived at {}; removing leftover source",
                src.display(),
                dst.display()
            );
            fs::remove_file(src)?;
            sync_parent(src)?;
            return Ok(());
        }
        return Err(IngestError::ArchiveConflict(dst.to_path_buf()).into());
    }

    match fs::rename(src, dst) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(e.into()),
        Err(e) => {
            log::debug!(
                "rename {} -> {} failed ({}); copying across volumes",
                src.display(),
                dst.display(),
                e
            );
            copy_into_place(src, dst)?;
            fs::remove_file(src)?;
            sync_parent(src)?;
        }
    }
    sync_dir(parent)?;
    log::debug!("archived {} -> {}", src.display(), dst.display());
    Ok(())
}

/// Write `data` to a temp file beside `path`, fsync, then rename over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = temp_sibling(path)?;
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

fn copy_into_place(src: &Path, dst: &Path) -> Result<()> {
    let tmp_path = temp_sibling(dst)?;
    fs::copy(src, &tmp_path)?;
    File::open(&tmp_path)?.sync_all()?;
    if let Err(e) = fs::rename(&tmp_path, dst) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    Ok(path.with_file_name(format!(".{}.partial", name.to_string_lossy())))
}

fn same_contents(a: &Path, b: &Path) -> Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    let mut left = BufReader::new(File::open(a)?);
    let mut right = BufReader::new(File::open(b)?);
    let mut lbuf = [0u8; 8192];
    let mut rbuf = [0u8; 8192];
    loop {
        let n = left.read(&mut lbuf)?;
        if n == 0 {
            return Ok(true);
        }
        right.read_exact(&mut rbuf[..n])?;
        if lbuf[..n] != rbuf[..n] {
            return Ok(false);
        }
    }
}

fn sync_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) => sync_dir(parent),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
