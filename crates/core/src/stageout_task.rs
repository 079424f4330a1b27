//! StageoutTask: an in-flight artifact the StageoutPipeline uploads
//! (spec.md §3).

use crate::job::JobId;
use crate::range::RangeId;
use serde::{Deserialize, Serialize};

/// Attempts are bounded by the retry policy (spec.md §4.5): one initial
/// attempt plus up to 3 retry sweeps.
pub const MAX_STAGEOUT_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageoutTask {
    pub range_id: RangeId,
    pub job_id: JobId,
    pub local_path: String,
    pub size: u64,
    pub destination_bucket_id: String,
    pub attempts: u32,
}

impl StageoutTask {
    pub fn new(
        range_id: RangeId,
        job_id: JobId,
        local_path: impl Into<String>,
        size: u64,
        destination_bucket_id: impl Into<String>,
    ) -> Self {
        Self {
            range_id,
            job_id,
            local_path: local_path.into(),
            size,
            destination_bucket_id: destination_bucket_id.into(),
            attempts: 0,
        }
    }

    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= MAX_STAGEOUT_ATTEMPTS
    }
}

/// A single zip-mode manifest line: `rangeId status outputCSV`, read from
/// or written to `EventService_premerge_eventranges_<jobId>.txt`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestLine {
    pub range_id: RangeId,
    pub status: String,
    pub output_csv: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_after_max_attempts() {
        let mut t = StageoutTask::new(
            RangeId::from_string("rng-0001"),
            JobId::from_string("job-0001"),
            "/tmp/a",
            10,
            "bucket-1",
        );
        for _ in 0..MAX_STAGEOUT_ATTEMPTS {
            assert!(!t.exhausted());
            t.record_attempt();
        }
        assert!(t.exhausted());
    }
}
