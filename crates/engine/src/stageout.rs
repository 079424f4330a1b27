//! StageoutPipeline: per-event and zip-mode upload of finished artifacts,
//! plus dispatcher reconciliation (spec.md §4.5).

use esd_adapters::dispatcher::DispatcherClient;
use esd_adapters::ObjectStore;
use esd_adapters::SiteInfoProvider;
use esd_core::config::StageoutMode;
use esd_core::dispatcher::UPDATE_EVENT_RANGES_BATCH_SIZE;
use esd_core::error::DriverError;
use esd_core::job::{Job, JobId};
use esd_core::range::{EventRange, RangeId, RangeStatus};
use esd_core::stageout_task::{ManifestLine, StageoutTask, MAX_STAGEOUT_ATTEMPTS};
use esd_core::dispatcher::UpdateEventRangeEntry;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// An upload that failed its first attempt, parked for the post-run
/// retry sweeps (spec.md §4.5 "Retry policy").
struct PendingStageout {
    job_id: JobId,
    range: EventRange,
    local_path: PathBuf,
    task: StageoutTask,
}

/// The outcome of one retry-sweep attempt on a parked upload, enough for
/// the caller to update the JobBook and reconcile with the dispatcher.
pub struct StageoutRetryOutcome {
    pub job_id: JobId,
    pub range_id: RangeId,
    pub n_events: u64,
    pub succeeded: bool,
    pub objstore_id: String,
}

/// Drives output artifacts to the object store and reconciles terminal
/// range statuses with the dispatcher.
pub struct StageoutPipeline {
    object_store: Arc<dyn ObjectStore>,
    site_info: Arc<dyn SiteInfoProvider>,
    dispatcher: Arc<dyn DispatcherClient>,
    mode: StageoutMode,
    copy_output_to_global: bool,
    semaphore: Arc<Semaphore>,
    /// Uploads whose first attempt failed, awaiting a retry sweep
    /// (spec.md §4.5 `failedStageOuts` queue).
    failed_stageouts: Mutex<Vec<PendingStageout>>,
}

impl StageoutPipeline {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        site_info: Arc<dyn SiteInfoProvider>,
        dispatcher: Arc<dyn DispatcherClient>,
        mode: StageoutMode,
        copy_output_to_global: bool,
        stageout_threads: u32,
    ) -> Self {
        Self {
            object_store,
            site_info,
            dispatcher,
            mode,
            copy_output_to_global,
            semaphore: Arc::new(Semaphore::new(stageout_threads.max(1) as usize)),
            failed_stageouts: Mutex::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> StageoutMode {
        self.mode
    }

    /// Whether any parked upload is still waiting for a retry sweep.
    pub fn has_pending_stageouts(&self) -> bool {
        !self.failed_stageouts.lock().is_empty()
    }

    /// Upload one range's artifact and transition it to `stagedOut`
    /// (spec.md §4.5 "Per-event mode"). On failure the upload is parked
    /// in the `failedStageOuts` queue for [`Self::retry_failed_stageouts`]
    /// rather than retried inline; the range is left at its current
    /// status and this still returns `Err` so the caller doesn't
    /// reconcile it as resolved yet.
    pub async fn stage_out_range(
        &self,
        job: &Job,
        range: &mut EventRange,
        local_path: &Path,
    ) -> Result<(), DriverError> {
        let _permit = self.semaphore.acquire().await.map_err(|_| DriverError::Unknown {
            reason: "stageout semaphore closed".into(),
        })?;
        let mut task = StageoutTask::new(
            range.range_id,
            job.id,
            local_path.display().to_string(),
            0,
            "pending-bucket",
        );
        task.record_attempt();
        match self.upload_once(range, local_path).await {
            Ok(()) => {
                range.transition(RangeStatus::StagedOut)?;
                if !self.copy_output_to_global {
                    let _ = std::fs::remove_file(local_path);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(range = %range.range_id, error = %e, "stage-out attempt failed, parking for retry");
                self.failed_stageouts.lock().push(PendingStageout {
                    job_id: job.id,
                    range: range.clone(),
                    local_path: local_path.to_path_buf(),
                    task,
                });
                Err(e)
            }
        }
    }

    /// Retry every parked upload once (spec.md §4.5 "the pipeline runs
    /// up to 3 retry sweeps"). Uploads that fail again are re-parked
    /// unless their attempts are exhausted (`MAX_STAGEOUT_ATTEMPTS`), in
    /// which case the outcome reports them as permanently failed so the
    /// caller can reconcile a `failed` status with the dispatcher.
    pub async fn retry_failed_stageouts(&self) -> Vec<StageoutRetryOutcome> {
        let pending: Vec<PendingStageout> = std::mem::take(&mut *self.failed_stageouts.lock());
        let mut outcomes = Vec::with_capacity(pending.len());
        for mut entry in pending {
            let Ok(_permit) = self.semaphore.acquire().await else {
                continue;
            };
            entry.task.record_attempt();
            match self.upload_once(&entry.range, Path::new(&entry.local_path)).await {
                Ok(()) => {
                    if !self.copy_output_to_global {
                        let _ = std::fs::remove_file(&entry.local_path);
                    }
                    let objstore_id = self.bucket_id_for(&entry.range.scope).await.unwrap_or_default();
                    outcomes.push(StageoutRetryOutcome {
                        job_id: entry.job_id,
                        range_id: entry.range.range_id,
                        n_events: entry.range.event_count(),
                        succeeded: true,
                        objstore_id,
                    });
                }
                Err(e) if entry.task.exhausted() => {
                    tracing::warn!(range = %entry.range.range_id, attempts = entry.task.attempts, error = %e, "stage-out retries exhausted, reporting failed");
                    outcomes.push(StageoutRetryOutcome {
                        job_id: entry.job_id,
                        range_id: entry.range.range_id,
                        n_events: 0,
                        succeeded: false,
                        objstore_id: String::new(),
                    });
                }
                Err(e) => {
                    tracing::warn!(range = %entry.range.range_id, attempt = entry.task.attempts, error = %e, "stage-out retry failed, re-parked");
                    self.failed_stageouts.lock().push(entry);
                }
            }
        }
        outcomes
    }

    async fn upload_once(&self, range: &EventRange, local_path: &Path) -> Result<(), DriverError> {
        let bucket_id = self.bucket_id_for(&range.scope).await?;
        let label = format!("{}.{}", range.lfn, range.range_id);
        self.object_store.put(local_path, &bucket_id, &label).await?;
        Ok(())
    }

    /// Resolve the object-store bucket ID a given scope/job key uploads
    /// under, for callers (e.g. dispatcher reconciliation) that need the
    /// same bucket ID the upload itself used.
    pub async fn bucket_id_for(&self, key: &str) -> Result<String, DriverError> {
        let endpoint = self
            .site_info
            .get_objectstore_ddm_endpoint(key)
            .await
            .map_err(|e| DriverError::Unknown { reason: e.to_string() })?;
        self.site_info
            .get_objectstore_bucket_id(&endpoint)
            .await
            .map_err(|e| DriverError::Unknown { reason: e.to_string() })
    }

    /// Package and upload a job's zip-mode premerge tar (spec.md §4.5
    /// "Zip mode"). Returns the manifest (including failed ranges, which
    /// have no tar entry) alongside the object-store bucket ID the tar
    /// was uploaded to — every range in the manifest is reconciled under
    /// that same bucket ID, finished or failed.
    pub async fn stage_out_zip(
        &self,
        dir: &Path,
        job_id: &str,
    ) -> Result<(Vec<ManifestLine>, String), DriverError> {
        let dump_path = esd_storage::event_dump::dump_path(dir, job_id);
        let lines = esd_storage::event_dump::read_dump(&dump_path)
            .map_err(|e| DriverError::StageOutFailed { job_id: job_id.to_string(), range_id: "*".into(), reason: e.to_string() })?;
        let (tar_path, _manifest_path, manifest) = esd_storage::premerge::package(dir, job_id, &lines)
            .map_err(|e| DriverError::StageOutFailed { job_id: job_id.to_string(), range_id: "*".into(), reason: e.to_string() })?;

        let bucket_id = self.bucket_id_for(job_id).await?;
        let label = format!("EventService_premerge_{job_id}.tar");
        self.object_store.put(&tar_path, &bucket_id, &label).await?;

        esd_storage::event_dump::mark_zipped(&dump_path)
            .map_err(|e| DriverError::StageOutFailed { job_id: job_id.to_string(), range_id: "*".into(), reason: e.to_string() })?;
        Ok((manifest, bucket_id))
    }

    /// Push terminal range statuses to the dispatcher, batched by
    /// [`UPDATE_EVENT_RANGES_BATCH_SIZE`] (spec.md §4.5 "Dispatcher
    /// reconciliation").
    pub async fn reconcile(&self, entries: &[UpdateEventRangeEntry]) -> Result<(), DriverError> {
        use esd_core::dispatcher::DispatcherOutcome;
        for batch in entries.chunks(UPDATE_EVENT_RANGES_BATCH_SIZE) {
            let outcome = self
                .dispatcher
                .update_event_ranges(batch)
                .await
                .map_err(|e| DriverError::DispatcherUnavailable { reason: e.to_string() })?;
            match outcome {
                DispatcherOutcome::Ok(()) | DispatcherOutcome::NoJobsAvailable | DispatcherOutcome::NoMoreEvents => {}
                DispatcherOutcome::TransientError(reason) | DispatcherOutcome::FatalError(reason) => {
                    return Err(DriverError::DispatcherUnavailable { reason });
                }
            }
        }
        Ok(())
    }
}

/// Exhausted-retry ceiling re-exported for callers building a
/// [`StageoutTask`] outside this module.
pub const MAX_ATTEMPTS: u32 = MAX_STAGEOUT_ATTEMPTS;

#[cfg(test)]
mod tests {
    use super::*;
    use esd_adapters::dispatcher::fake::FakeDispatcher;
    use esd_adapters::{FakeObjectStore, FakeSiteInfo};
    use esd_core::dispatcher::DispatcherOutcome;
    use esd_core::job::JobBuilder;
    use esd_core::range::test_support::sample_range;

    fn pipeline(mode: StageoutMode) -> (StageoutPipeline, Arc<FakeObjectStore>, Arc<FakeDispatcher>) {
        let store = Arc::new(FakeObjectStore::default());
        let dispatcher = Arc::new(FakeDispatcher::default());
        let site_info = Arc::new(FakeSiteInfo::new(""));
        let pipeline = StageoutPipeline::new(store.clone(), site_info, dispatcher.clone(), mode, false, 4);
        (pipeline, store, dispatcher)
    }

    #[tokio::test]
    async fn per_event_upload_transitions_range_and_removes_local_file() {
        let (pipeline, store, _dispatcher) = pipeline(StageoutMode::PerEvent);
        let dir = tempfile::tempdir().unwrap();
        let job = JobBuilder::default().build();
        let mut range = sample_range(job.id, 1);
        range.transition(RangeStatus::Assigned).unwrap();
        range.transition(RangeStatus::Finished).unwrap();
        let local_path = dir.path().join("out.root");
        std::fs::write(&local_path, b"bytes").unwrap();

        pipeline.stage_out_range(&job, &mut range, &local_path).await.unwrap();

        assert_eq!(range.status, RangeStatus::StagedOut);
        assert!(!local_path.exists());
        assert_eq!(store.uploads.lock().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_splits_into_batches_of_100() {
        let (pipeline, _store, dispatcher) = pipeline(StageoutMode::PerEvent);
        for _ in 0..3 {
            dispatcher.push_jobs(DispatcherOutcome::NoJobsAvailable); // unrelated queue, unused here
        }
        let entries: Vec<UpdateEventRangeEntry> = (0..250)
            .map(|i| UpdateEventRangeEntry {
                event_range_id: format!("rng-{i:04}"),
                event_status: "finished".into(),
                objstore_id: "bucket-1".into(),
            })
            .collect();
        pipeline.reconcile(&entries).await.unwrap();
        assert_eq!(dispatcher.range_updates.lock().len(), 250);
    }

    #[tokio::test]
    async fn zip_mode_packages_and_uploads_then_marks_dump_zipped() {
        let (pipeline, store, _dispatcher) = pipeline(StageoutMode::Zip);
        let dir = tempfile::tempdir().unwrap();
        let dump_path = esd_storage::event_dump::dump_path(dir.path(), "job-0001");
        std::fs::write(&dump_path, "job-0001 rng-1 finished out1.root\n").unwrap();
        std::fs::write(dir.path().join("out1.root"), b"bytes").unwrap();

        let (manifest, _bucket_id) = pipeline.stage_out_zip(dir.path(), "job-0001").await.unwrap();

        assert_eq!(manifest.len(), 1);
        assert!(!dump_path.exists());
        assert!(dir.path().join("job-0001_event_status.dump.zipped").exists());
        assert_eq!(store.uploads.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_upload_is_parked_and_retried_until_it_succeeds() {
        let (pipeline, store, _dispatcher) = pipeline(StageoutMode::PerEvent);
        let dir = tempfile::tempdir().unwrap();
        let job = JobBuilder::default().build();
        let mut range = sample_range(job.id, 1);
        range.transition(RangeStatus::Assigned).unwrap();
        range.transition(RangeStatus::Finished).unwrap();
        let local_path = dir.path().join("out.root");
        std::fs::write(&local_path, b"bytes").unwrap();
        let label = format!("{}.{}", range.lfn, range.range_id);
        store.fail_labels.lock().insert(label.clone());

        let err = pipeline.stage_out_range(&job, &mut range, &local_path).await;
        assert!(err.is_err());
        assert_eq!(range.status, RangeStatus::Finished);
        assert!(pipeline.has_pending_stageouts());
        assert!(local_path.exists(), "local file must survive a failed attempt");

        store.fail_labels.lock().remove(&label);
        let outcomes = pipeline.retry_failed_stageouts().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].succeeded);
        assert_eq!(outcomes[0].range_id, range.range_id);
        assert_eq!(outcomes[0].n_events, range.event_count());
        assert!(!pipeline.has_pending_stageouts());
    }

    #[tokio::test]
    async fn exhausted_retries_report_failed_and_stop_parking() {
        let (pipeline, store, _dispatcher) = pipeline(StageoutMode::PerEvent);
        let dir = tempfile::tempdir().unwrap();
        let job = JobBuilder::default().build();
        let mut range = sample_range(job.id, 1);
        range.transition(RangeStatus::Assigned).unwrap();
        range.transition(RangeStatus::Finished).unwrap();
        let local_path = dir.path().join("out.root");
        std::fs::write(&local_path, b"bytes").unwrap();
        let label = format!("{}.{}", range.lfn, range.range_id);
        store.fail_labels.lock().insert(label);

        assert!(pipeline.stage_out_range(&job, &mut range, &local_path).await.is_err());

        // spec.md §4.5: one initial attempt plus up to 3 retry sweeps,
        // matching MAX_STAGEOUT_ATTEMPTS = 4.
        let mut last_outcomes = Vec::new();
        for _ in 0..3 {
            last_outcomes = pipeline.retry_failed_stageouts().await;
        }
        assert_eq!(last_outcomes.len(), 1);
        assert!(!last_outcomes[0].succeeded);
        assert!(!pipeline.has_pending_stageouts());
    }
}
