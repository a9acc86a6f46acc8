//! Container encoding boundary.
//!
//! The measurement-container codec is external to the pipeline. It is reached
//! through `SessionEncoder`: `encode` produces the raw container from the merged
//! frames, `extract` produces the decoded container given the DBC files.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::frame::Frame;
use crate::report::{Reporter, Warning};

pub trait SessionEncoder {
    /// File extension of the containers this encoder writes, without the dot.
    fn container_extension(&self) -> &str;

    fn encode(&self, frames: &[Frame]) -> Result<Vec<u8>>;

    fn extract(&self, raw: &[u8], dbc_files: &[PathBuf]) -> Result<Vec<u8>>;
}

impl<E: SessionEncoder + ?Sized> SessionEncoder for Box<E> {
    fn container_extension(&self) -> &str {
        (**self).container_extension()
    }

    fn encode(&self, frames: &[Frame]) -> Result<Vec<u8>> {
        (**self).encode(frames)
    }

    fn extract(&self, raw: &[u8], dbc_files: &[PathBuf]) -> Result<Vec<u8>> {
        (**self).extract(raw, dbc_files)
    }
}

/// Newline-delimited JSON frames, for deployments without the native codec.
///
/// The decoded container is the raw one preceded by a manifest line naming the
/// DBC files it should be read with.
#[derive(Clone, Copy, Debug, Default)]
pub struct NdjsonEncoder;

#[derive(Serialize, Deserialize)]
struct DbcManifest {
    dbc_files: Vec<String>,
}

impl SessionEncoder for NdjsonEncoder {
    fn container_extension(&self) -> &str {
        "ndjson"
    }

    fn encode(&self, frames: &[Frame]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(frames.len() * 96);
        for frame in frames {
            serde_json::to_writer(&mut out, frame)?;
            out.push(b'\n');
        }
        Ok(out)
    }

    fn extract(&self, raw: &[u8], dbc_files: &[PathBuf]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(raw).map_err(|e| anyhow!("raw container is not UTF-8: {}", e))?;
        let manifest = DbcManifest {
            dbc_files: dbc_files
                .iter()
                .map(|path| path.display().to_string())
                .collect(),
        };
        let mut out = serde_json::to_vec(&manifest)?;
        out.push(b'\n');
        for (idx, line) in text.lines().enumerate() {
            let frame: Frame = serde_json::from_str(line)
                .map_err(|e| anyhow!("raw container line {}: {}", idx + 1, e))?;
            serde_json::to_writer(&mut out, &frame)?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

/// DBC files for a unit type: its own folder first, then the global folder.
///
/// A missing folder is reported and contributes nothing.
pub fn resolve_dbc_files(
    dbc_root: &Path,
    unit_type: &str,
    reporter: &dyn Reporter,
) -> Result<Vec<PathBuf>> {
    let mut files = dbc_files_in(&dbc_root.join(unit_type), reporter)?;
    files.extend(dbc_files_in(dbc_root, reporter)?);
    Ok(files)
}

fn dbc_files_in(folder: &Path, reporter: &dyn Reporter) -> Result<Vec<PathBuf>> {
    if !folder.is_dir() {
        reporter.warning(Warning::MissingDbcFolder {
            folder: folder.to_path_buf(),
        });
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(folder)? {
        let path = entry?.path();
        let is_dbc = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("dbc"));
        if is_dbc && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
