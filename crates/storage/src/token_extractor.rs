//! `TokenExtractor_filelist` — one `<GUID>,PFN:<path>` line per input
//! file requiring a TAG (spec.md §4.3, §6).

use crate::error::StorageError;
use std::path::Path;

pub fn write_filelist(path: &Path, entries: &[(String, String)]) -> Result<(), StorageError> {
    let mut body = String::new();
    for (guid, tag_path) in entries {
        body.push_str(&format!("{guid},PFN:{tag_path}\n"));
    }
    std::fs::write(path, body).map_err(|e| StorageError::io(path.display().to_string(), e))
}

pub fn read_filelist(path: &Path) -> Result<Vec<(String, String)>, StorageError> {
    let raw = std::fs::read_to_string(path).map_err(|e| StorageError::io(path.display().to_string(), e))?;
    let mut entries = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (guid, rest) = line.split_once(',').ok_or_else(|| {
            StorageError::format("TokenExtractor_filelist", path.display().to_string(), format!("missing comma in line {line:?}"))
        })?;
        let tag_path = rest.strip_prefix("PFN:").ok_or_else(|| {
            StorageError::format("TokenExtractor_filelist", path.display().to_string(), format!("missing PFN: prefix in line {line:?}"))
        })?;
        entries.push((guid.to_string(), tag_path.to_string()));
    }
    Ok(entries)
}
