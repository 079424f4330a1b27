//! Job: a claimed unit of work (spec.md §3).

use crate::error::DriverError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

crate::define_id! {
    /// Dispatcher-assigned, process-unique job identifier.
    pub struct JobId("job-");
}

/// One entry of a job's input-file manifest. Immutable after claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub lfn: String,
    pub guid: String,
    pub size: u64,
    pub checksum: String,
}

/// One entry of a job's output-file manifest. Frozen before stage-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub lfn: String,
    pub dataset: String,
}

/// A job's lifecycle state. Only the Lifecycle and the Scheduler may
/// transition a job (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Starting,
    Transferring,
    Running,
    StagingOut,
    Finished,
    Failed,
}

crate::simple_display! {
    JobState {
        Starting => "starting",
        Transferring => "transferring",
        Running => "running",
        StagingOut => "stagingOut",
        Finished => "finished",
        Failed => "failed",
    }
}

impl JobState {
    pub fn can_transition(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Starting, Transferring)
                | (Starting, Failed)
                | (Transferring, Running)
                | (Transferring, Failed)
                | (Running, StagingOut)
                | (Running, Failed)
                | (StagingOut, Finished)
                | (StagingOut, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed)
    }
}

/// A claimed job: attributes fixed at claim time plus the mutable state
/// field the Lifecycle/Scheduler drive forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub workdir: PathBuf,
    pub input_files: Vec<InputFile>,
    pub output_files: Vec<OutputFile>,
    pub run_command_template: String,
    pub prod_user_id: String,
    pub core_count: u32,
    pub state: JobState,
    /// HPCManager-reported sub-status string, surfaced in heartbeats.
    #[serde(default)]
    pub hpc_substate: Option<String>,
    #[serde(default)]
    pub error_code: Option<i32>,
    /// Wall-clock spent on stage-in (set once by Lifecycle::stage_in).
    #[serde(default)]
    pub time_stage_in_ms: Option<u64>,
    /// Number of events the payload actually processed (`nEventsW`),
    /// used by finalize to detect `OverSubscribedEvents`.
    #[serde(default)]
    pub n_events_written: u64,
}

impl Job {
    pub fn new(
        id: JobId,
        workdir: PathBuf,
        input_files: Vec<InputFile>,
        output_files: Vec<OutputFile>,
        run_command_template: impl Into<String>,
        prod_user_id: impl Into<String>,
    ) -> Self {
        Self {
            id,
            workdir,
            input_files,
            output_files,
            run_command_template: run_command_template.into(),
            prod_user_id: prod_user_id.into(),
            core_count: 0,
            state: JobState::Starting,
            hpc_substate: None,
            error_code: None,
            time_stage_in_ms: None,
            n_events_written: 0,
        }
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), DriverError> {
        if !self.state.can_transition(next) {
            return Err(DriverError::InvalidTransition {
                entity: format!("job {}", self.id),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Mark failed with an error code, bypassing the normal
    /// `can_transition` check when the job is already in a state from
    /// which `Failed` is always reachable (e.g. a failure observed
    /// outside the main state flow, such as recovery reconciliation).
    pub fn force_fail(&mut self, error_code: i32) {
        self.state = JobState::Failed;
        self.error_code = Some(error_code);
    }
}

crate::builder! {
    pub struct JobBuilder => Job {
        into {
            workdir: PathBuf = PathBuf::from("/tmp/test-job"),
            run_command_template: String = "athena.py",
            prod_user_id: String = "prodUser",
        }
        set {
            input_files: Vec<InputFile> = Vec::new(),
            output_files: Vec<OutputFile> = Vec::new(),
            core_count: u32 = 1,
            state: JobState = JobState::Starting,
            n_events_written: u64 = 0,
        }
        option {
            hpc_substate: String = None,
            error_code: i32 = None,
            time_stage_in_ms: u64 = None,
        }
        computed {
            id: JobId = JobId::new(),
        }
    }
}

/// A production job descriptor as the dispatcher or the `newJobDef` file
/// hands it over, before it has been turned into a [`Job`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: String,
    pub jobset_id: String,
    pub task_id: String,
    pub workdir: PathBuf,
    pub input_files: Vec<InputFile>,
    pub output_files: Vec<OutputFile>,
    pub run_command_template: String,
    pub prod_user_id: String,
    /// Caller-visible hashmap of vars threaded through to the payload
    /// adapter (experiment-specific run-command fields).
    #[serde(default)]
    pub vars: HashMap<String, String>,
}
