//! `jobState-<jobId>.json` — the recovery snapshot (spec.md §6,
//! Design Note §9: deliberately versioned JSON, not a pickle-equivalent
//! binary blob mixing unrelated concerns).

use crate::error::StorageError;
use esd_core::job::Job;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Versioned checkpoint enabling recovery: enough to resume polling and
/// output draining after a process restart (spec.md §4.4
/// `saveState`/`recoveryState`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub version: u32,
    pub job: Job,
    /// Opaque, back-end-specific payload produced by
    /// `HpcManager::save_state` and handed back to `recovery_state`
    /// unparsed.
    pub payload_state: serde_json::Value,
    pub recovery_attempt: u32,
}

fn snapshot_path(dir: &Path, job_id: &str) -> PathBuf {
    dir.join(format!("jobState-{job_id}.json"))
}

pub fn write_snapshot(dir: &Path, snapshot: &RecoverySnapshot) -> Result<(), StorageError> {
    let path = snapshot_path(dir, snapshot.job.id.as_str());
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| StorageError::format("recovery snapshot", path.display().to_string(), e.to_string()))?;
    std::fs::write(&path, json).map_err(|e| StorageError::io(path.display().to_string(), e))
}

pub fn read_snapshot(dir: &Path, job_id: &str) -> Result<RecoverySnapshot, StorageError> {
    let path = snapshot_path(dir, job_id);
    let raw = std::fs::read_to_string(&path).map_err(|e| StorageError::io(path.display().to_string(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| StorageError::format("recovery snapshot", path.display().to_string(), e.to_string()))
}

/// Every `jobState-*.json` file found under `dir`.
pub fn read_all_snapshots(dir: &Path) -> Result<Vec<RecoverySnapshot>, StorageError> {
    let entries = std::fs::read_dir(dir).map_err(|e| StorageError::io(dir.display().to_string(), e))?;
    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io(dir.display().to_string(), e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("jobState-") && name.ends_with(".json") {
            let raw = std::fs::read_to_string(entry.path())
                .map_err(|e| StorageError::io(entry.path().display().to_string(), e))?;
            let snapshot = serde_json::from_str(&raw).map_err(|e| {
                StorageError::format("recovery snapshot", entry.path().display().to_string(), e.to_string())
            })?;
            snapshots.push(snapshot);
        }
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use esd_core::job::JobBuilder;

    #[test]
    fn round_trips_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobBuilder::default().build();
        let snapshot = RecoverySnapshot {
            version: 1,
            job: job.clone(),
            payload_state: serde_json::json!({"batchId": "123"}),
            recovery_attempt: 0,
        };
        write_snapshot(dir.path(), &snapshot).unwrap();
        let loaded = read_snapshot(dir.path(), job.id.as_str()).unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.recovery_attempt, 0);
    }
}
