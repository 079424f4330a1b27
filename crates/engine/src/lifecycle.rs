//! Lifecycle: per-job setup, stage-in, payload-command preparation, and
//! finalize (spec.md §4.3). All paths are rooted at the job's working
//! directory.

use esd_adapters::{Mover, SiteInfoProvider};
use esd_core::error::DriverError;
use esd_core::job::{Job, JobDescriptor, JobState};
use esd_core::range::RangeStatus;
use esd_storage::catalog::PoolFileCatalog;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The opaque "HPCJob" record handed to the PayloadSupervisor (spec.md
/// §4.3 "The result of preparation").
#[derive(Debug, Clone)]
pub struct HpcJobRecord {
    pub token_extract_cmd: Option<String>,
    pub athena_mp_cmd: String,
    pub pre_setup: Option<String>,
    pub post_run: Option<String>,
    pub pool_file_catalog: PathBuf,
    pub input_files: Vec<PathBuf>,
    pub global_working_dir: PathBuf,
    pub zip_file_name: PathBuf,
    pub zip_event_ranges_name: PathBuf,
    pub stageout_threads: u32,
}

/// Drives one job through setup/stage-in/command-prep/finalize.
/// Dependency-injected movers and site oracle; owns the "available
/// files"/"available TAG files" caches the spec assigns to the
/// Lifecycle (spec.md §5 "Shared-resource policy").
pub struct Lifecycle {
    mover: Arc<dyn Mover>,
    site_info: Arc<dyn SiteInfoProvider>,
    available_files: HashMap<String, PathBuf>,
    available_tags: HashMap<String, PathBuf>,
}

impl Lifecycle {
    pub fn new(mover: Arc<dyn Mover>, site_info: Arc<dyn SiteInfoProvider>) -> Self {
        Self {
            mover,
            site_info,
            available_files: HashMap::new(),
            available_tags: HashMap::new(),
        }
    }

    /// Register a file already present locally (e.g. shared between
    /// jobs in the same allocation), so `stage_in` skips the mover.
    pub fn register_available_file(&mut self, lfn: impl Into<String>, path: impl Into<PathBuf>) {
        self.available_files.insert(lfn.into(), path.into());
    }

    /// Write `Job_<id>.json` and copy the queue-configuration file into
    /// the job's working directory (spec.md §4.3 "Setup").
    pub async fn setup(
        &self,
        job: &Job,
        queuedata_src: Option<&Path>,
    ) -> Result<(), DriverError> {
        std::fs::create_dir_all(&job.workdir)
            .map_err(|e| DriverError::PrepareFailed { job_id: job.id.to_string(), reason: e.to_string() })?;
        esd_storage::checkpoint::write_checkpoint(&job.workdir, job)
            .map_err(|e| DriverError::PrepareFailed { job_id: job.id.to_string(), reason: e.to_string() })?;

        if let Some(src) = queuedata_src {
            let file_name = self
                .site_info
                .get_queuedata_file_name()
                .await
                .map_err(|e| DriverError::PrepareFailed { job_id: job.id.to_string(), reason: e.to_string() })?;
            let dest = job.workdir.join(file_name);
            std::fs::copy(src, &dest).map_err(|e| DriverError::PrepareFailed {
                job_id: job.id.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Stage every input file in, consulting the available-files cache
    /// first (spec.md §4.3 "Stage-in"). Returns elapsed milliseconds.
    pub async fn stage_in(&mut self, job: &mut Job) -> Result<(), DriverError> {
        let started = std::time::Instant::now();
        for input in job.input_files.clone() {
            let local_path = job.workdir.join(&input.lfn);
            if let Some(cached) = self.available_files.get(&input.lfn).cloned() {
                std::fs::copy(&cached, &local_path).map_err(|e| DriverError::StageInFailed {
                    job_id: job.id.to_string(),
                    reason: e.to_string(),
                })?;
            } else {
                self.mover
                    .get(&input.lfn, &input.guid, &local_path)
                    .await
                    .map_err(|_| DriverError::StageInFailed {
                        job_id: job.id.to_string(),
                        reason: format!("mover failed to stage in {}", input.lfn),
                    })?;
                self.available_files.insert(input.lfn.clone(), local_path);
            }
        }
        job.time_stage_in_ms = Some(started.elapsed().as_millis() as u64);
        Ok(())
    }

    /// Build the catalogs, rewrite the run command, and produce the
    /// opaque HPCJob record (spec.md §4.3 "Payload command preparation").
    pub fn prepare_payload_command(
        &mut self,
        job: &Job,
        descriptor: &JobDescriptor,
        copy_input_files: bool,
        stageout_threads: u32,
    ) -> Result<HpcJobRecord, DriverError> {
        let mut catalog = PoolFileCatalog::default();
        let mut temp_catalog = PoolFileCatalog::default();
        let mut input_files = Vec::new();
        for input in &job.input_files {
            let local_path = job.workdir.join(&input.lfn);
            catalog.insert(input.guid.clone(), local_path.display().to_string());
            temp_catalog.insert(input.guid.clone(), format!("HPCWORKINGDIR/{}", input.lfn));
            input_files.push(local_path);
        }
        let catalog_path = job.workdir.join("PoolFileCatalog_HPC.xml");
        let temp_catalog_path = job.workdir.join("PoolFileCatalog_Temp.xml");
        esd_storage::catalog::write_catalog(&catalog_path, &catalog)
            .map_err(|e| DriverError::PrepareFailed { job_id: job.id.to_string(), reason: e.to_string() })?;
        esd_storage::catalog::write_catalog(&temp_catalog_path, &temp_catalog)
            .map_err(|e| DriverError::PrepareFailed { job_id: job.id.to_string(), reason: e.to_string() })?;

        let mut cmd = job.run_command_template.clone();

        let collapsed: String = cmd.split_whitespace().collect::<Vec<_>>().join(" ");
        let wants_token_extractor =
            collapsed.contains("TokenScatterer") || collapsed.contains("UseTokenExtractor=True");
        let token_extract_cmd = if wants_token_extractor {
            Some(self.build_token_extractor(job)?)
        } else {
            None
        };

        cmd = prepend_sentinel_exports(&cmd, job.id.as_str());
        if !copy_input_files {
            cmd = rewrite_input_args_to_local_paths(&cmd, &input_files);
        }
        cmd = strip_hpc_inapplicable_flags(&cmd);
        cmd = finish_command(&cmd);

        let _ = &descriptor.vars;

        Ok(HpcJobRecord {
            token_extract_cmd,
            athena_mp_cmd: cmd,
            pre_setup: None,
            post_run: None,
            pool_file_catalog: catalog_path,
            input_files,
            global_working_dir: job.workdir.clone(),
            zip_file_name: job.workdir.join(format!("EventService_premerge_{}.tar", job.id)),
            zip_event_ranges_name: job
                .workdir
                .join(format!("EventService_premerge_eventranges_{}.txt", job.id)),
            stageout_threads,
        })
    }

    fn build_token_extractor(&mut self, job: &Job) -> Result<String, DriverError> {
        let mut entries = Vec::with_capacity(job.input_files.len());
        for input in &job.input_files {
            let tag_path = self.available_tags.entry(input.guid.clone()).or_insert_with(|| {
                job.workdir.join(format!("{}.tag", input.guid))
            });
            entries.push((input.guid.clone(), tag_path.display().to_string()));
        }
        let filelist_path = job.workdir.join("TokenExtractor_filelist");
        esd_storage::token_extractor::write_filelist(&filelist_path, &entries)
            .map_err(|e| DriverError::PrepareFailed { job_id: job.id.to_string(), reason: e.to_string() })?;
        Ok(format!(
            "TokenExtractorAthenaMP.py --filelist={}",
            filelist_path.display()
        ))
    }

    /// Remove input files and the packaging tar; verify all ranges are
    /// terminal; set the final job state (spec.md §4.3 "Finalize").
    pub fn finalize(
        &self,
        job: &mut Job,
        ranges: &[&esd_core::range::EventRange],
    ) -> Result<(), DriverError> {
        for input in &job.input_files {
            let path = job.workdir.join(&input.lfn);
            let _ = std::fs::remove_file(path);
        }
        let tar_path = job.workdir.join(format!("EventService_premerge_{}.tar", job.id));
        let _ = std::fs::remove_file(tar_path);

        let all_terminal = ranges.iter().all(|r| r.status.is_terminal());
        if !all_terminal {
            return Err(DriverError::RangesOutstanding { job_id: job.id.to_string() });
        }

        if job.n_events_written == 0 {
            job.transition(JobState::Failed)?;
            job.error_code = Some(DriverError::OverSubscribedEvents { job_id: job.id.to_string() }.code());
        } else {
            job.transition(JobState::Finished)?;
        }
        Ok(())
    }
}

fn prepend_sentinel_exports(cmd: &str, job_id: &str) -> String {
    let sentinel = format!("HPC-EVENTRANGES-{job_id}");
    let preexec = format!("--preExec='from PyJobTransforms.trfUtils import *; PILOT_EVENTRANGECHANNEL=\"{sentinel}\"'");
    let cmd = if let Some(start) = cmd.find("--preExec") {
        let end = cmd[start..].find(' ').map(|i| start + i).unwrap_or(cmd.len());
        format!("{}{}{}", &cmd[..start], preexec, &cmd[end..])
    } else {
        format!("{cmd} {preexec}")
    };
    format!("export USING_COMPACT=1;export PILOT_EVENTRANGECHANNEL={sentinel};{cmd}")
}

fn rewrite_input_args_to_local_paths(cmd: &str, input_files: &[PathBuf]) -> String {
    let joined = input_files.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(",");
    let mut out = String::new();
    for token in cmd.split(' ') {
        if token.starts_with("--input") && token.contains('=') {
            let (flag, _) = token.split_once('=').unwrap_or((token, ""));
            out.push_str(flag);
            out.push('=');
            out.push_str(&joined);
        } else {
            out.push_str(token);
        }
        out.push(' ');
    }
    out.trim_end().to_string()
}

fn strip_hpc_inapplicable_flags(cmd: &str) -> String {
    let without_dbrelease: String = cmd
        .split(' ')
        .filter(|tok| !tok.starts_with("--DBRelease="))
        .collect::<Vec<_>>()
        .join(" ");
    without_dbrelease.replace("UseFrontier.py,", "").replace(",UseFrontier.py", "").replace("UseFrontier.py", "")
}

fn finish_command(cmd: &str) -> String {
    let with_redirect = format!("{cmd} 1>athenaMP_stdout.txt 2>athenaMP_stderr.txt");
    let mut collapsed = with_redirect;
    while collapsed.contains(";;") {
        collapsed = collapsed.replace(";;", ";");
    }
    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use esd_adapters::{FakeMover, FakeSiteInfo};
    use esd_core::job::{InputFile, JobBuilder};

    fn lifecycle() -> Lifecycle {
        Lifecycle::new(Arc::new(FakeMover::default()), Arc::new(FakeSiteInfo::new("")))
    }

    #[tokio::test]
    async fn stage_in_populates_available_files_cache() {
        let mut lc = lifecycle();
        let dir = tempfile::tempdir().unwrap();
        let mut job = JobBuilder::default()
            .workdir(dir.path().to_path_buf())
            .input_files(vec![InputFile {
                lfn: "input1.pool.root".into(),
                guid: "guid-1".into(),
                size: 10,
                checksum: "abc".into(),
            }])
            .build();
        lc.stage_in(&mut job).await.unwrap();
        assert!(job.time_stage_in_ms.is_some());
        assert!(dir.path().join("input1.pool.root").exists());
    }

    #[tokio::test]
    async fn stage_in_failure_marks_driver_error() {
        let mover = Arc::new(FakeMover::default());
        mover.fail_lfns.lock().insert("bad.pool.root".to_string());
        let mut lc = Lifecycle::new(mover, Arc::new(FakeSiteInfo::new("")));
        let dir = tempfile::tempdir().unwrap();
        let mut job = JobBuilder::default()
            .workdir(dir.path().to_path_buf())
            .input_files(vec![InputFile {
                lfn: "bad.pool.root".into(),
                guid: "guid-1".into(),
                size: 10,
                checksum: "abc".into(),
            }])
            .build();
        let err = lc.stage_in(&mut job).await.unwrap_err();
        assert!(matches!(err, DriverError::StageInFailed { .. }));
    }

    #[test]
    fn prepend_sentinel_exports_inserts_preexec() {
        let cmd = prepend_sentinel_exports("athena.py --foo=bar", "job-0001");
        assert!(cmd.starts_with("export USING_COMPACT=1;export PILOT_EVENTRANGECHANNEL="));
        assert!(cmd.contains("--preExec="));
    }

    #[test]
    fn strip_hpc_inapplicable_flags_removes_dbrelease_and_frontier() {
        let cmd = "athena.py --DBRelease=current --preInclude=UseFrontier.py,Foo.py";
        let stripped = strip_hpc_inapplicable_flags(cmd);
        assert!(!stripped.contains("--DBRelease"));
        assert!(!stripped.contains("UseFrontier.py"));
        assert!(stripped.contains("Foo.py"));
    }

    #[test]
    fn finish_command_collapses_double_semicolons_and_redirects() {
        let cmd = finish_command("export A=1;;export B=2;athena.py");
        assert!(!cmd.contains(";;"));
        assert!(cmd.ends_with("1>athenaMP_stdout.txt 2>athenaMP_stderr.txt"));
    }

    #[test]
    fn rewrite_input_args_concatenates_local_paths() {
        let cmd = "athena.py --inputEVNTFile=orig.pool.root --foo=bar";
        let rewritten = rewrite_input_args_to_local_paths(cmd, &[PathBuf::from("/work/a.root"), PathBuf::from("/work/b.root")]);
        assert!(rewritten.contains("--inputEVNTFile=/work/a.root,/work/b.root"));
        assert!(rewritten.contains("--foo=bar"));
    }
}
