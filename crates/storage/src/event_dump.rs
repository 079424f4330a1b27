//! `<jobId>_event_status.dump` — per-line payload output report
//! consumed by zip-mode stage-out (spec.md §4.5, §6).
//!
//! Line format: `jobId rangeId status outputCSV`. Once processed the
//! dump is renamed to `…dump.zipped`, making the packaging operation
//! idempotent against re-runs.

use crate::error::StorageError;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpLine {
    pub job_id: String,
    pub range_id: String,
    pub status: String,
    /// Comma-separated output files as the payload wrote them; empty
    /// for failed ranges.
    pub output_csv: String,
}

impl DumpLine {
    /// The output files the payload listed, in order.
    pub fn output_files(&self) -> Vec<&str> {
        if self.output_csv.is_empty() {
            Vec::new()
        } else {
            self.output_csv.split(',').collect()
        }
    }
}

pub fn dump_path(dir: &Path, job_id: &str) -> PathBuf {
    dir.join(format!("{job_id}_event_status.dump"))
}

pub fn read_dump(path: &Path) -> Result<Vec<DumpLine>, StorageError> {
    let raw = std::fs::read_to_string(path).map_err(|e| StorageError::io(path.display().to_string(), e))?;
    let mut lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(4, ' ');
        let (job_id, range_id, status) = match (parts.next(), parts.next(), parts.next()) {
            (Some(j), Some(r), Some(s)) => (j, r, s),
            _ => {
                return Err(StorageError::format(
                    "event_status.dump",
                    path.display().to_string(),
                    format!("short line {line:?}"),
                ))
            }
        };
        let output_csv = parts.next().unwrap_or("").to_string();
        lines.push(DumpLine {
            job_id: job_id.to_string(),
            range_id: range_id.to_string(),
            status: status.to_string(),
            output_csv,
        });
    }
    Ok(lines)
}

/// Rename the dump to `…dump.zipped` once it has been fully processed.
pub fn mark_zipped(path: &Path) -> Result<PathBuf, StorageError> {
    let zipped = path.with_extension("dump.zipped");
    std::fs::rename(path, &zipped).map_err(|e| StorageError::io(path.display().to_string(), e))?;
    Ok(zipped)
}
