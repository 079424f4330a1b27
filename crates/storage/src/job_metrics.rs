//! `jobMetrics-rank*.json` / `jobMetrics-yoda.json` — the payload's
//! per-rank CPU-time accounting side-channel (SPEC_FULL.md §6.1,
//! grounded on `original_source/RunJobHpcEvent.py`), consumed by the
//! Scheduler's heartbeat and finalize's output-metadata production.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    #[serde(default)]
    pub cpu_consumption_time: f64,
    #[serde(default)]
    pub n_events_read: u64,
    #[serde(default)]
    pub n_events_written: u64,
}

impl std::ops::Add for JobMetrics {
    type Output = JobMetrics;

    fn add(self, rhs: JobMetrics) -> JobMetrics {
        JobMetrics {
            cpu_consumption_time: self.cpu_consumption_time + rhs.cpu_consumption_time,
            n_events_read: self.n_events_read + rhs.n_events_read,
            n_events_written: self.n_events_written + rhs.n_events_written,
        }
    }
}

/// Sum every `jobMetrics-rank*.json` found in `dir`, falling back to
/// `jobMetrics-yoda.json` if no per-rank files exist. Missing files are
/// not an error: the heartbeat simply reports zero for this tick.
pub fn read_job_metrics(dir: &Path) -> Result<JobMetrics, StorageError> {
    let entries = std::fs::read_dir(dir).map_err(|e| StorageError::io(dir.display().to_string(), e))?;
    let mut total = JobMetrics::default();
    let mut found_rank_file = false;

    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io(dir.display().to_string(), e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("jobMetrics-rank") && name.ends_with(".json") {
            found_rank_file = true;
            total = total + read_one(&entry.path())?;
        }
    }

    if found_rank_file {
        return Ok(total);
    }

    let yoda_path = dir.join("jobMetrics-yoda.json");
    if yoda_path.exists() {
        return read_one(&yoda_path);
    }
    Ok(JobMetrics::default())
}

fn read_one(path: &Path) -> Result<JobMetrics, StorageError> {
    let raw = std::fs::read_to_string(path).map_err(|e| StorageError::io(path.display().to_string(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| StorageError::format("jobMetrics", path.display().to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_per_rank_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("jobMetrics-rank0.json"),
            r#"{"cpu_consumption_time":1.5,"n_events_read":10,"n_events_written":9}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("jobMetrics-rank1.json"),
            r#"{"cpu_consumption_time":2.0,"n_events_read":5,"n_events_written":5}"#,
        )
        .unwrap();
        let metrics = read_job_metrics(dir.path()).unwrap();
        assert_eq!(metrics.n_events_read, 15);
        assert_eq!(metrics.n_events_written, 14);
        assert!((metrics.cpu_consumption_time - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn falls_back_to_yoda_file_when_no_rank_files_exist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("jobMetrics-yoda.json"),
            r#"{"cpu_consumption_time":1.0,"n_events_read":1,"n_events_written":1}"#,
        )
        .unwrap();
        let metrics = read_job_metrics(dir.path()).unwrap();
        assert_eq!(metrics.n_events_read, 1);
    }

    #[test]
    fn returns_zero_metrics_when_nothing_is_present() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = read_job_metrics(dir.path()).unwrap();
        assert_eq!(metrics, JobMetrics::default());
    }
}
