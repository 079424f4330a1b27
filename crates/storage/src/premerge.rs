//! Zip-mode stage-out packaging: `EventService_premerge_<jobId>.tar` and
//! `EventService_premerge_eventranges_<jobId>.txt` (spec.md §4.5, §6).

use crate::error::StorageError;
use crate::event_dump::DumpLine;
use esd_core::stageout_task::ManifestLine;
use esd_core::range::RangeId;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn tar_path(dir: &Path, job_id: &str) -> PathBuf {
    dir.join(format!("EventService_premerge_{job_id}.tar"))
}

pub fn manifest_path(dir: &Path, job_id: &str) -> PathBuf {
    dir.join(format!("EventService_premerge_eventranges_{job_id}.txt"))
}

/// Of a finished line's comma-separated output files, only all but the
/// trailing 3 are archived (the payload always appends a log and two
/// bookkeeping files last).
fn files_for_tar(line: &DumpLine) -> Vec<&str> {
    let files = line.output_files();
    let keep = files.len().saturating_sub(3);
    files[..keep].to_vec()
}

/// Build the per-job tar and manifest from a parsed dump, deleting each
/// archived output file as it's added (spec.md §4.5).
pub fn package(
    dir: &Path,
    job_id: &str,
    lines: &[DumpLine],
) -> Result<(PathBuf, PathBuf, Vec<ManifestLine>), StorageError> {
    let tar_file_path = tar_path(dir, job_id);
    let tar_file = std::fs::File::create(&tar_file_path)
        .map_err(|e| StorageError::io(tar_file_path.display().to_string(), e))?;
    let mut builder = tar::Builder::new(tar_file);
    let mut manifest = Vec::with_capacity(lines.len());

    for line in lines {
        if line.status == "finished" {
            for file in files_for_tar(line) {
                let file_path = dir.join(file);
                builder
                    .append_path_with_name(&file_path, file)
                    .map_err(|e| StorageError::io(file_path.display().to_string(), e))?;
                std::fs::remove_file(&file_path)
                    .map_err(|e| StorageError::io(file_path.display().to_string(), e))?;
            }
        }
        manifest.push(ManifestLine {
            range_id: RangeId::from_string(line.range_id.clone()),
            status: line.status.clone(),
            output_csv: line.output_csv.clone(),
        });
    }
    builder.finish().map_err(|e| StorageError::io(tar_file_path.display().to_string(), e))?;

    let manifest_file_path = manifest_path(dir, job_id);
    write_manifest(&manifest_file_path, &manifest)?;
    Ok((tar_file_path, manifest_file_path, manifest))
}

fn write_manifest(path: &Path, lines: &[ManifestLine]) -> Result<(), StorageError> {
    let mut body = String::new();
    for line in lines {
        body.push_str(&format!("{} {} {}\n", line.range_id, line.status, line.output_csv));
    }
    std::fs::write(path, body).map_err(|e| StorageError::io(path.display().to_string(), e))
}

pub fn read_manifest(path: &Path) -> Result<Vec<ManifestLine>, StorageError> {
    let raw = std::fs::read_to_string(path).map_err(|e| StorageError::io(path.display().to_string(), e))?;
    let mut lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        let (range_id, status) = match (parts.next(), parts.next()) {
            (Some(r), Some(s)) => (r, s),
            _ => {
                return Err(StorageError::format(
                    "premerge manifest",
                    path.display().to_string(),
                    format!("short line {line:?}"),
                ))
            }
        };
        let output_csv = parts.next().unwrap_or("").to_string();
        lines.push(ManifestLine {
            range_id: RangeId::from_string(range_id),
            status: status.to_string(),
            output_csv,
        });
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_output(dir: &Path, name: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(b"payload-bytes").unwrap();
    }

    #[test]
    fn packages_finished_lines_and_skips_trailing_three_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.root", "b.root", "log.txt", "meta.json", "stats.json"] {
            write_output(dir.path(), name);
        }
        let lines = vec![DumpLine {
            job_id: "job-0001".into(),
            range_id: "rng-1".into(),
            status: "finished".into(),
            output_csv: "a.root,b.root,log.txt,meta.json,stats.json".into(),
        }];
        let (tar, manifest, parsed) = package(dir.path(), "job-0001", &lines).unwrap();
        assert!(tar.exists());
        assert!(manifest.exists());
        assert_eq!(parsed.len(), 1);
        // Archived files are deleted, trailing three survive untouched.
        assert!(!dir.path().join("a.root").exists());
        assert!(!dir.path().join("b.root").exists());
        assert!(dir.path().join("log.txt").exists());
    }

    #[test]
    fn manifest_includes_failed_ranges_with_no_tar_entry() {
        let dir = tempfile::tempdir().unwrap();
        let lines = vec![DumpLine {
            job_id: "job-0001".into(),
            range_id: "rng-2".into(),
            status: "failed".into(),
            output_csv: "".into(),
        }];
        let (_, manifest_file, parsed) = package(dir.path(), "job-0001", &lines).unwrap();
        let reread = read_manifest(&manifest_file).unwrap();
        assert_eq!(reread, parsed);
        assert_eq!(reread[0].status, "failed");
    }
}
