//! Error taxonomy (spec §7).
//!
//! Every class the core distinguishes carries a stable `code()` so the
//! process exit code can surface "the first fatal pilot error code"
//! without re-deriving it from the error's `Display` text.

use thiserror::Error;

/// A single job's identifier, used only for attaching context to errors —
/// kept as a plain `String` here so `esd-core::error` has no dependency
/// on `job::JobId` (avoids a cycle; callers attach the typed ID via
/// `tracing` spans instead).
pub type JobIdStr = String;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Single job: stage-in of an input file failed. Fails that job on
    /// the dispatcher, removes it from the JobBook, and continues.
    #[error("stage-in failed for job {job_id}: {reason}")]
    StageInFailed { job_id: JobIdStr, reason: String },

    /// Single range: an upload attempt failed. Enqueued to the retry
    /// queue; reported `failed` after the retry sweeps are exhausted.
    #[error("stage-out failed for range {range_id} (job {job_id}): {reason}")]
    StageOutFailed { job_id: JobIdStr, range_id: String, reason: String },

    /// Single job: TAG/catalog preparation failed while building the
    /// payload command.
    #[error("payload command preparation failed for job {job_id}: {reason}")]
    PrepareFailed { job_id: JobIdStr, reason: String },

    /// Single job, attempt < 10: recoverable, the dispatcher should retry.
    #[error("recoverable error for job {job_id} (attempt {attempt}): {reason}")]
    EsRecoverable { job_id: JobIdStr, attempt: u32, reason: String },

    /// Single job: zero events were processed. Terminal failure with a
    /// distinct, stable error code.
    #[error("job {job_id} processed zero events (oversubscribed)")]
    OverSubscribedEvents { job_id: JobIdStr },

    /// Single file: a mover's get (stage-in) watchdog expired.
    #[error("get timed out for {lfn} after {elapsed_s}s")]
    GetTimeout { lfn: String, elapsed_s: u64 },

    /// Single file: a mover's put (stage-out) watchdog expired.
    #[error("put timed out for {path} after {elapsed_s}s")]
    PutTimeout { path: String, elapsed_s: u64 },

    /// Scheduler: the dispatcher was unreachable. Counted; the fill loop
    /// aborts after 5 consecutive occurrences but the run itself never
    /// aborts because of this alone.
    #[error("dispatcher unavailable: {reason}")]
    DispatcherUnavailable { reason: String },

    /// JobBook: a status/state transition outside the permitted chain
    /// (spec.md §3) was attempted.
    #[error("invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition { entity: String, from: String, to: String },

    /// JobBook: `remove` was called while a range was not yet `reported`.
    #[error("job {job_id} has ranges outstanding, cannot remove")]
    RangesOutstanding { job_id: JobIdStr },

    /// Anywhere: an error that doesn't fit another class. Per-job paths
    /// fail that job; global paths log and continue to finalize.
    #[error("unknown error: {reason}")]
    Unknown { reason: String },
}

impl DriverError {
    /// Stable exit/error code for this class, independent of which job or
    /// range triggered it. Used by `main()` to pick "the first fatal
    /// pilot error code" as the process exit code (spec.md §7).
    pub fn code(&self) -> i32 {
        match self {
            DriverError::StageInFailed { .. } => 1300,
            DriverError::StageOutFailed { .. } => 1301,
            DriverError::PrepareFailed { .. } => 1302,
            DriverError::EsRecoverable { .. } => 1303,
            DriverError::OverSubscribedEvents { .. } => 1304,
            DriverError::GetTimeout { .. } => 1305,
            DriverError::PutTimeout { .. } => 1306,
            DriverError::DispatcherUnavailable { .. } => 1307,
            DriverError::InvalidTransition { .. } => 1308,
            DriverError::RangesOutstanding { .. } => 1309,
            DriverError::Unknown { .. } => 1399,
        }
    }

    /// Whether this error scopes to a single job (vs. the whole run).
    pub fn is_per_job(&self) -> bool {
        matches!(
            self,
            DriverError::StageInFailed { .. }
                | DriverError::PrepareFailed { .. }
                | DriverError::EsRecoverable { .. }
                | DriverError::OverSubscribedEvents { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_across_instances() {
        let a = DriverError::StageInFailed { job_id: "a".into(), reason: "x".into() };
        let b = DriverError::StageInFailed { job_id: "b".into(), reason: "y".into() };
        assert_eq!(a.code(), b.code());
    }

    #[test]
    fn per_job_classification_matches_spec_table() {
        assert!(DriverError::StageInFailed { job_id: "a".into(), reason: "x".into() }.is_per_job());
        assert!(!DriverError::DispatcherUnavailable { reason: "x".into() }.is_per_job());
        assert!(!DriverError::Unknown { reason: "x".into() }.is_per_job());
    }
}
