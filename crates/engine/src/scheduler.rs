//! Scheduler: resource acquisition, demand sizing, job claiming, core
//! partitioning, and the progress-reporting loop (spec.md §4.2).

use crate::lifecycle::Lifecycle;
use crate::payload::PayloadSupervisor;
use esd_adapters::dispatcher::DispatcherClient;
use esd_adapters::hpc_manager::{FreeResources, HpcJobSpec};
use esd_core::clock::Clock;
use esd_core::config::SiteConfig;
use esd_core::dispatcher::DispatcherOutcome;
use esd_core::error::DriverError;
use esd_core::job::{Job, JobDescriptor, JobId, JobState};
use esd_core::jobbook::JobBook;
use esd_core::range::{EventRange, RangeId, RangeStatus};
use std::sync::Arc;
use std::time::Duration;

/// Consecutive dispatcher failures that abort the fill loop (spec.md
/// §4.2 step 4c).
const MAX_CONSECUTIVE_DISPATCHER_FAILURES: u32 = 5;

/// The 30 s poll cadence for `PayloadSupervisor::poll` (spec.md §4.2
/// step 6, §5).
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// The 10 min heartbeat cadence (spec.md §4.2 step 6).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(600);

pub struct Scheduler {
    dispatcher: Arc<dyn DispatcherClient>,
    /// Descriptors of every job claimed this run, keyed by the `JobId`
    /// `descriptor_to_job` minted for it. Held here (rather than on
    /// `Job` itself) so `submit_all` can hand the original descriptor
    /// back to `prepare_payload_command` without the JobBook carrying
    /// claim-time-only fields like `vars` for the rest of a job's life.
    descriptors: parking_lot::Mutex<std::collections::HashMap<JobId, JobDescriptor>>,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<dyn DispatcherClient>) -> Self {
        Self { dispatcher, descriptors: parking_lot::Mutex::new(std::collections::HashMap::new()) }
    }

    /// `neededRanges = min(eventsCapacity, configuredMaxEvents)` (spec.md
    /// §4.2 step 2).
    pub fn demand_sizing(free: FreeResources, site: &SiteConfig) -> (u64, u64) {
        let max_events = if site.max_events < 0 { u64::MAX } else { site.max_events as u64 };
        let needed = free.events_capacity.min(max_events);
        let max_ranges_per_job = site.events_limit_per_job.max(1) as u64;
        (needed, max_ranges_per_job)
    }

    /// Load the bootstrap job descriptor and claim ranges for it (spec.md
    /// §4.2 step 3).
    pub async fn bootstrap_job(
        &self,
        jobbook: &mut JobBook,
        lifecycle: &Lifecycle,
        descriptor: JobDescriptor,
        needed_ranges: &mut u64,
        queuedata_src: Option<&std::path::Path>,
    ) -> Result<JobId, DriverError> {
        let job = descriptor_to_job(&descriptor);
        let job_id = job.id;
        jobbook.add_job(job);
        self.descriptors.lock().insert(job_id, descriptor.clone());
        lifecycle
            .setup(jobbook.get_job(&job_id).expect("just inserted"), queuedata_src)
            .await?;
        self.claim_ranges(jobbook, &descriptor, job_id, needed_ranges).await?;
        Ok(job_id)
    }

    async fn claim_ranges(
        &self,
        jobbook: &mut JobBook,
        descriptor: &JobDescriptor,
        job_id: JobId,
        needed_ranges: &mut u64,
    ) -> Result<(), DriverError> {
        if *needed_ranges == 0 {
            return Ok(());
        }
        let outcome = self
            .dispatcher
            .download_event_ranges(
                &descriptor.job_id,
                &descriptor.jobset_id,
                &descriptor.task_id,
                *needed_ranges as u32,
            )
            .await
            .map_err(|e| DriverError::DispatcherUnavailable { reason: e.to_string() })?;
        match outcome {
            DispatcherOutcome::Ok(dtos) => {
                let claimed = dtos.len() as u64;
                let ranges: Vec<EventRange> =
                    dtos.into_iter().map(|dto| dto_to_range(dto, job_id)).collect();
                jobbook.add_ranges(job_id, ranges)?;
                *needed_ranges = needed_ranges.saturating_sub(claimed);
                Ok(())
            }
            DispatcherOutcome::NoMoreEvents => {
                *needed_ranges = 0;
                Ok(())
            }
            DispatcherOutcome::NoJobsAvailable => Ok(()),
            DispatcherOutcome::TransientError(reason) | DispatcherOutcome::FatalError(reason) => {
                Err(DriverError::DispatcherUnavailable { reason })
            }
        }
    }

    /// Fill to `parallel_jobs` by repeatedly asking the dispatcher for
    /// more jobs (spec.md §4.2 step 4).
    pub async fn fill_to_parallel_jobs(
        &self,
        jobbook: &mut JobBook,
        lifecycle: &mut Lifecycle,
        needed_ranges: &mut u64,
        max_ranges_per_job: u64,
        parallel_jobs: u64,
        queuedata_src: Option<&std::path::Path>,
    ) -> Result<(), DriverError> {
        let mut consecutive_failures = 0u32;
        while *needed_ranges > 0 && (jobbook.job_count() as u64) < parallel_jobs {
            let to_get = (*needed_ranges / max_ranges_per_job.max(1)).clamp(1, 50) as u32;
            match self.dispatcher.get_job(to_get).await {
                Ok(DispatcherOutcome::Ok(descriptors)) => {
                    consecutive_failures = 0;
                    for descriptor in descriptors {
                        if !validate_job_descriptor(&descriptor) {
                            let _ = self
                                .dispatcher
                                .update_job(&descriptor.job_id, "failed", Some(DriverError::PrepareFailed {
                                    job_id: descriptor.job_id.clone(),
                                    reason: "post-get validation failed".into(),
                                }.code()))
                                .await;
                            continue;
                        }
                        let job = descriptor_to_job(&descriptor);
                        let job_id = job.id;
                        jobbook.add_job(job);
                        self.descriptors.lock().insert(job_id, descriptor.clone());
                        if let Err(e) = lifecycle.setup(jobbook.get_job(&job_id).expect("just inserted"), queuedata_src).await {
                            tracing::warn!(job = %job_id, error = %e, "setup failed for newly claimed job");
                        }
                        self.claim_ranges(jobbook, &descriptor, job_id, needed_ranges).await?;
                        if *needed_ranges == 0 {
                            break;
                        }
                    }
                }
                Ok(DispatcherOutcome::NoJobsAvailable) => break,
                Ok(DispatcherOutcome::NoMoreEvents) => {
                    *needed_ranges = 0;
                    break;
                }
                Ok(DispatcherOutcome::TransientError(reason)) => {
                    consecutive_failures += 1;
                    tracing::warn!(reason, consecutive_failures, "dispatcher getJob transient failure");
                }
                Ok(DispatcherOutcome::FatalError(reason)) => {
                    consecutive_failures += 1;
                    tracing::warn!(reason, consecutive_failures, "dispatcher getJob fatal failure");
                }
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(error = %e, consecutive_failures, "dispatcher getJob transport failure");
                }
            }
            if consecutive_failures >= MAX_CONSECUTIVE_DISPATCHER_FAILURES {
                tracing::error!("aborting fill loop after {consecutive_failures} consecutive dispatcher failures");
                break;
            }
        }
        Ok(())
    }

    /// `job.coreCount = floor(totalCores / nJobs)` for every job (spec.md
    /// §4.2 step 5).
    pub fn partition_cores(jobbook: &mut JobBook, total_cores: u32) -> Result<(), DriverError> {
        let job_ids: Vec<JobId> = jobbook.iterate_jobs().map(|j| j.id).collect();
        let n = job_ids.len() as u32;
        if n == 0 {
            return Ok(());
        }
        let per_job = total_cores / n;
        for job_id in job_ids {
            jobbook.set_core_count(&job_id, per_job)?;
        }
        Ok(())
    }

    /// Stage every freshly-claimed job's inputs in (spec.md §4.3
    /// "Stage-in"). A job whose stage-in fails is marked failed on the
    /// dispatcher, has its claimed ranges reported back as failed, and is
    /// dropped from the JobBook entirely — it must not count towards
    /// core partitioning (spec.md §8 scenario 4). Surviving jobs move
    /// from `transferring` to `running`.
    pub async fn stage_in_all(
        &self,
        jobbook: &mut JobBook,
        lifecycle: &mut Lifecycle,
    ) -> Result<(), DriverError> {
        let job_ids: Vec<JobId> = jobbook
            .iterate_jobs()
            .filter(|j| j.state == JobState::Transferring)
            .map(|j| j.id)
            .collect();

        for job_id in job_ids {
            let mut job = jobbook.get_job(&job_id).expect("job_id came from jobbook").clone();
            match lifecycle.stage_in(&mut job).await {
                Ok(()) => {
                    jobbook.set_job_state(&job_id, JobState::Running, None, None)?;
                }
                Err(e) => {
                    tracing::warn!(job = %job_id, error = %e, "stage-in failed, dropping job");
                    let _ = jobbook.set_job_state(&job_id, JobState::Failed, None, Some(e.code()));
                    let _ = self
                        .dispatcher
                        .update_job(&job_id.to_string(), "failed", Some(e.code()))
                        .await;
                    self.report_ranges_failed_and_drop(jobbook, &job_id).await;
                }
            }
        }
        Ok(())
    }

    /// Report every one of `job_id`'s claimed ranges as `failed` to the
    /// dispatcher, walk them to `reported`, and remove the job from the
    /// JobBook. Used when a job is abandoned before it ever reaches the
    /// payload (stage-in failure).
    async fn report_ranges_failed_and_drop(&self, jobbook: &mut JobBook, job_id: &JobId) {
        let range_ids: Vec<RangeId> =
            jobbook.ranges_for_job(job_id).iter().map(|r| r.range_id).collect();
        let mut entries = Vec::with_capacity(range_ids.len());
        for range_id in &range_ids {
            if let Some(range) = jobbook.range(job_id, range_id) {
                if range.status.can_transition(RangeStatus::Failed) {
                    let _ = jobbook.set_range_status(job_id, range_id, RangeStatus::Failed);
                }
            }
            entries.push(esd_core::dispatcher::UpdateEventRangeEntry {
                event_range_id: range_id.to_string(),
                event_status: "failed".into(),
                objstore_id: String::new(),
            });
        }
        if !entries.is_empty() && self.dispatcher.update_event_ranges(&entries).await.is_ok() {
            for range_id in &range_ids {
                let _ = jobbook.set_range_status(job_id, range_id, RangeStatus::Reported);
            }
        }
        let _ = jobbook.remove(job_id);
        self.descriptors.lock().remove(job_id);
    }

    /// Build each surviving `running` job's `HPCJob` record via
    /// [`Lifecycle::prepare_payload_command`] (spec.md §4.3 "Payload
    /// command preparation": sentinel exports, `--DBRelease=`/
    /// `UseFrontier.py` stripping, `--input*` rewriting, token-extractor
    /// detection, and the `PoolFileCatalog_*`/`TokenExtractor_filelist`
    /// artifacts), submitting the prepared command rather than the raw
    /// dispatcher template. Run after [`Scheduler::partition_cores`] so
    /// `coreCount` is final. A job whose preparation fails is treated
    /// like a stage-in failure: reported `failed`, its ranges reported
    /// back and dropped, and it is excluded from the submitted batch.
    pub async fn submit_all(
        &self,
        jobbook: &mut JobBook,
        lifecycle: &mut Lifecycle,
        copy_input_files: bool,
        stageout_threads: u32,
        supervisor: &PayloadSupervisor,
    ) -> Result<(), DriverError> {
        let job_ids: Vec<JobId> = jobbook
            .iterate_jobs()
            .filter(|j| j.state == JobState::Running)
            .map(|j| j.id)
            .collect();

        let mut specs = Vec::new();
        let mut ranges_by_job = std::collections::HashMap::new();
        for job_id in job_ids {
            let job = jobbook.get_job(&job_id).expect("job_id came from jobbook").clone();
            let descriptor = self
                .descriptors
                .lock()
                .get(&job_id)
                .cloned()
                .unwrap_or_else(|| descriptor_from_job(&job));
            match lifecycle.prepare_payload_command(&job, &descriptor, copy_input_files, stageout_threads) {
                Ok(record) => {
                    specs.push(HpcJobSpec {
                        job_id: job.id.to_string(),
                        workdir: job.workdir.clone(),
                        run_command: record.athena_mp_cmd,
                        core_count: job.core_count,
                    });
                    let range_ids = jobbook
                        .ranges_for_job(&job_id)
                        .iter()
                        .map(|r| r.range_id.to_string())
                        .collect();
                    ranges_by_job.insert(job_id.to_string(), range_ids);
                }
                Err(e) => {
                    tracing::warn!(job = %job_id, error = %e, "payload command preparation failed, dropping job");
                    let _ = jobbook.set_job_state(&job_id, JobState::Failed, None, Some(e.code()));
                    let _ = self
                        .dispatcher
                        .update_job(&job_id.to_string(), "failed", Some(e.code()))
                        .await;
                    self.report_ranges_failed_and_drop(jobbook, &job_id).await;
                }
            }
        }
        supervisor.init_and_submit(&specs, &ranges_by_job).await
    }

    /// Push a heartbeat for every job in `jobbook` (spec.md §4.2 step 6).
    pub async fn heartbeat_all(&self, jobbook: &JobBook) {
        for job in jobbook.iterate_jobs() {
            let exit_code = if job.state.is_terminal() { job.error_code.or(Some(0)) } else { None };
            if let Err(e) = self.dispatcher.update_job(&job.id.to_string(), &job.state.to_string(), exit_code).await {
                tracing::warn!(job = %job.id, error = %e, "heartbeat update_job failed");
            }
        }
    }
}

fn validate_job_descriptor(descriptor: &JobDescriptor) -> bool {
    !descriptor.job_id.is_empty() && !descriptor.run_command_template.is_empty()
}

fn descriptor_to_job(descriptor: &JobDescriptor) -> Job {
    let mut job = Job::new(
        JobId::from_string(&descriptor.job_id),
        descriptor.workdir.clone(),
        descriptor.input_files.clone(),
        descriptor.output_files.clone(),
        descriptor.run_command_template.clone(),
        "prodUser",
    );
    let _ = job.transition(JobState::Transferring);
    job
}

/// Reconstruct a minimal descriptor from a job already in the JobBook,
/// for the defensive case where no claim-time descriptor was recorded
/// (e.g. a job restored by recovery without going through `bootstrap_job`
/// or `fill_to_parallel_jobs`).
fn descriptor_from_job(job: &Job) -> JobDescriptor {
    JobDescriptor {
        job_id: job.id.to_string(),
        jobset_id: String::new(),
        task_id: String::new(),
        workdir: job.workdir.clone(),
        input_files: job.input_files.clone(),
        output_files: job.output_files.clone(),
        run_command_template: job.run_command_template.clone(),
        prod_user_id: job.prod_user_id.clone(),
        vars: Default::default(),
    }
}

fn dto_to_range(dto: esd_core::dispatcher::EventRangeDto, job_id: JobId) -> EventRange {
    let mut range = EventRange::new(
        RangeId::from_string(dto.event_range_id),
        job_id,
        dto.lfn,
        dto.guid,
        dto.start_event,
        dto.last_event,
        dto.scope,
    );
    let _ = range.transition(RangeStatus::Assigned);
    range
}

/// Sleep helper that honors an injected [`Clock`] in tests; production
/// code always uses the real `tokio::time::sleep`.
pub async fn sleep_poll_interval<C: Clock>(_clock: &C) {
    tokio::time::sleep(POLL_INTERVAL).await;
}
