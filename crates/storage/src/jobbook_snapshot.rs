//! `jobbook-snapshot.json` — a whole-JobBook snapshot (jobs and their
//! event ranges together), written incrementally so a hard kill mid-run
//! only loses work since the last drain (spec.md §4.6 "Recovery entry
//! point"). Per-job `Job_*.json` checkpoints only carry the job, not its
//! ranges; this is the format `esd-engine::recovery::recover` prefers
//! when present.

use crate::error::StorageError;
use esd_core::jobbook::JobBookSnapshot;
use std::path::{Path, PathBuf};

fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join("jobbook-snapshot.json")
}

pub fn write(dir: &Path, snapshot: &JobBookSnapshot) -> Result<(), StorageError> {
    let path = snapshot_path(dir);
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| StorageError::format("JobBook snapshot", path.display().to_string(), e.to_string()))?;
    std::fs::write(&path, json).map_err(|e| StorageError::io(path.display().to_string(), e))
}

/// `None` if no snapshot has been written yet (first run, or a workdir
/// recovered from per-job checkpoints only).
pub fn read(dir: &Path) -> Result<Option<JobBookSnapshot>, StorageError> {
    let path = snapshot_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path).map_err(|e| StorageError::io(path.display().to_string(), e))?;
    let snapshot = serde_json::from_str(&raw)
        .map_err(|e| StorageError::format("JobBook snapshot", path.display().to_string(), e.to_string()))?;
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use esd_core::job::JobBuilder;

    #[test]
    fn round_trips_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobBuilder::default().build();
        let snapshot = JobBookSnapshot { jobs: vec![job], ranges: vec![] };
        write(dir.path(), &snapshot).unwrap();
        let loaded = read(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.jobs.len(), 1);
    }

    #[test]
    fn missing_snapshot_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(dir.path()).unwrap().is_none());
    }
}
