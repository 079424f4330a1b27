//! `Job_<jobId>.json` — checkpoint of a claimed job (spec.md §6).

use crate::error::StorageError;
use esd_core::job::Job;
use std::path::{Path, PathBuf};

fn checkpoint_path(dir: &Path, job_id: &str) -> PathBuf {
    dir.join(format!("Job_{job_id}.json"))
}

pub fn write_checkpoint(dir: &Path, job: &Job) -> Result<(), StorageError> {
    let path = checkpoint_path(dir, job.id.as_str());
    let json = serde_json::to_string_pretty(job)
        .map_err(|e| StorageError::format("Job checkpoint", path.display().to_string(), e.to_string()))?;
    std::fs::write(&path, json).map_err(|e| StorageError::io(path.display().to_string(), e))
}

pub fn read_checkpoint(dir: &Path, job_id: &str) -> Result<Job, StorageError> {
    let path = checkpoint_path(dir, job_id);
    let raw = std::fs::read_to_string(&path).map_err(|e| StorageError::io(path.display().to_string(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| StorageError::format("Job checkpoint", path.display().to_string(), e.to_string()))
}

/// Every `Job_*.json` file found directly under `dir`, used by recovery
/// to rebuild the JobBook (spec.md §4.6 "Recovery entry point").
pub fn read_all_checkpoints(dir: &Path) -> Result<Vec<Job>, StorageError> {
    let entries = std::fs::read_dir(dir).map_err(|e| StorageError::io(dir.display().to_string(), e))?;
    let mut jobs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io(dir.display().to_string(), e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("Job_") && name.ends_with(".json") {
            let raw = std::fs::read_to_string(entry.path())
                .map_err(|e| StorageError::io(entry.path().display().to_string(), e))?;
            let job = serde_json::from_str(&raw).map_err(|e| {
                StorageError::format("Job checkpoint", entry.path().display().to_string(), e.to_string())
            })?;
            jobs.push(job);
        }
    }
    Ok(jobs)
}
