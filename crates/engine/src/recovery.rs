//! Crash recovery: rebuild the JobBook and rebind the PayloadSupervisor
//! from what was checkpointed to disk (spec.md §4.6 "Recovery entry
//! point").

use crate::payload::PayloadSupervisor;
use esd_adapters::hpc_manager::{HpcManager, HpcManagerCheckpoint};
use esd_core::error::DriverError;
use esd_core::jobbook::JobBook;
use std::path::Path;
use std::sync::Arc;

/// Rebuild the JobBook and rebind `manager` to the most recent
/// `jobState-*.json` snapshot, if any exists.
///
/// Prefers the whole-book `jobbook-snapshot.json` (jobs and ranges
/// together, refreshed after every drain) when present; a workdir that
/// only has per-job `Job_*.json` checkpoints recovers its jobs with no
/// ranges, since those files never carried ranges to begin with.
pub async fn recover(
    dir: &Path,
    manager: Arc<dyn HpcManager>,
) -> Result<(JobBook, PayloadSupervisor), DriverError> {
    let jobbook = match esd_storage::jobbook_snapshot::read(dir)
        .map_err(|e| DriverError::Unknown { reason: e.to_string() })?
    {
        Some(snapshot) => JobBook::restore(snapshot),
        None => {
            let jobs = esd_storage::checkpoint::read_all_checkpoints(dir)
                .map_err(|e| DriverError::Unknown { reason: e.to_string() })?;
            let mut jobbook = JobBook::new();
            for job in jobs {
                jobbook.add_job(job);
            }
            jobbook
        }
    };

    let snapshots = esd_storage::recovery::read_all_snapshots(dir)
        .map_err(|e| DriverError::Unknown { reason: e.to_string() })?;
    if let Some(latest) = snapshots.into_iter().max_by_key(|s| s.recovery_attempt) {
        let checkpoint: HpcManagerCheckpoint = serde_json::from_value(latest.payload_state)
            .map_err(|e| DriverError::Unknown { reason: format!("malformed HpcManagerCheckpoint: {e}") })?;
        manager.recovery_state(checkpoint).await?;
    }

    Ok((jobbook, PayloadSupervisor::new(manager)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use esd_adapters::hpc_manager::{fake::FakeHpcManager, FreeResources, HpcJobState};
    use esd_core::job::JobBuilder;

    #[tokio::test]
    async fn recovers_jobs_and_rebinds_the_manager_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobBuilder::default().build();
        esd_storage::checkpoint::write_checkpoint(dir.path(), &job).unwrap();

        let checkpoint = HpcManagerCheckpoint {
            version: 1,
            batch_id: Some("batch-42".into()),
            state: HpcJobState::Running,
            drained_range_ids: vec![],
        };
        let snapshot = esd_storage::recovery::RecoverySnapshot {
            version: 1,
            job: job.clone(),
            payload_state: serde_json::to_value(&checkpoint).unwrap(),
            recovery_attempt: 0,
        };
        esd_storage::recovery::write_snapshot(dir.path(), &snapshot).unwrap();

        let manager = Arc::new(FakeHpcManager::new(FreeResources {
            nodes: 1,
            cores: 4,
            walltime_s: 100,
            events_capacity: 100,
        }));
        let (jobbook, _supervisor) = recover(dir.path(), manager).await.unwrap();
        assert_eq!(jobbook.job_count(), 1);
        assert!(jobbook.contains_job(&job.id));
    }

    #[tokio::test]
    async fn recovery_with_no_checkpoints_yields_an_empty_jobbook() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(FakeHpcManager::new(FreeResources {
            nodes: 1,
            cores: 4,
            walltime_s: 100,
            events_capacity: 100,
        }));
        let (jobbook, _supervisor) = recover(dir.path(), manager).await.unwrap();
        assert_eq!(jobbook.job_count(), 0);
    }

    #[tokio::test]
    async fn a_jobbook_snapshot_restores_ranges_that_a_job_checkpoint_alone_cannot() {
        use esd_core::jobbook::JobBookSnapshot;
        use esd_core::range::test_support::sample_range;

        let dir = tempfile::tempdir().unwrap();
        let job = JobBuilder::default().build();
        let range = sample_range(job.id, 1);
        esd_storage::jobbook_snapshot::write(
            dir.path(),
            &JobBookSnapshot { jobs: vec![job.clone()], ranges: vec![range.clone()] },
        )
        .unwrap();

        let manager = Arc::new(FakeHpcManager::new(FreeResources {
            nodes: 1,
            cores: 4,
            walltime_s: 100,
            events_capacity: 100,
        }));
        let (jobbook, _supervisor) = recover(dir.path(), manager).await.unwrap();
        assert_eq!(jobbook.job_count(), 1);
        assert_eq!(jobbook.ranges_for_job(&job.id).len(), 1);
    }
}
