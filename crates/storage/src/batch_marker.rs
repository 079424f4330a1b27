//! `batchid.<id>.txt` — batch-system job identifier marker for external
//! observers (spec.md §4.4, §6).

use crate::error::StorageError;
use std::path::Path;

pub fn write_marker(dir: &Path, batch_id: &str) -> Result<(), StorageError> {
    let path = dir.join(format!("batchid.{batch_id}.txt"));
    std::fs::write(&path, batch_id).map_err(|e| StorageError::io(path.display().to_string(), e))
}

/// The batch id from the first `batchid.*.txt` marker found in `dir`,
/// if any (used by recovery to confirm a prior submission happened).
pub fn read_marker(dir: &Path) -> Result<Option<String>, StorageError> {
    let entries = std::fs::read_dir(dir).map_err(|e| StorageError::io(dir.display().to_string(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io(dir.display().to_string(), e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("batchid.") {
            if let Some(id) = rest.strip_suffix(".txt") {
                return Ok(Some(id.to_string()));
            }
        }
    }
    Ok(None)
}
