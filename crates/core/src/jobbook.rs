//! JobBook: the process-wide job/event-range registry (spec.md §4.1).
//!
//! All mutation happens through `&mut self` methods; the type carries no
//! interior mutability of its own; it is the caller's job (the
//! coordinator task, spec.md §5) to own the only `&mut JobBook` in the
//! process. Readers get a [`JobBook::snapshot`] deep copy.

use crate::error::DriverError;
use crate::job::{Job, JobId, JobState};
use crate::range::{EventRange, RangeId, RangeStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `jobId -> (Job, map[rangeId -> EventRange])`. A recovery handle isn't
/// stored here — `esd-engine::payload` owns the PayloadSupervisor's
/// opaque checkpoint and keys it by the same `JobId`.
#[derive(Debug, Default)]
pub struct JobBook {
    jobs: HashMap<JobId, JobEntry>,
    /// Every range ID ever admitted, including ones whose owning job has
    /// since been removed. Enforces invariant 4 (no two ranges share an
    /// identifier across the whole process lifetime) without keeping
    /// terminated jobs around.
    seen_range_ids: std::collections::HashSet<RangeId>,
}

#[derive(Debug, Clone)]
struct JobEntry {
    job: Job,
    ranges: HashMap<RangeId, EventRange>,
}

/// Deep-copy snapshot suitable for persistence (`esd-storage`'s recovery
/// checkpoint) or read-only inspection by the Scheduler's reporting loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobBookSnapshot {
    pub jobs: Vec<Job>,
    pub ranges: Vec<EventRange>,
}

impl JobBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&mut self, job: Job) {
        self.jobs.insert(job.id, JobEntry { job, ranges: HashMap::new() });
    }

    pub fn contains_job(&self, job_id: &JobId) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn get_job(&self, job_id: &JobId) -> Option<&Job> {
        self.jobs.get(job_id).map(|e| &e.job)
    }

    /// Admit a batch of newly-claimed ranges for `job_id`. Every range
    /// must carry a fresh ID per invariant 4.
    pub fn add_ranges(
        &mut self,
        job_id: JobId,
        ranges: Vec<EventRange>,
    ) -> Result<(), DriverError> {
        let entry = self.jobs.get_mut(&job_id).ok_or_else(|| DriverError::Unknown {
            reason: format!("add_ranges: job {job_id} not in JobBook"),
        })?;
        for range in ranges {
            if !self.seen_range_ids.insert(range.range_id) {
                return Err(DriverError::Unknown {
                    reason: format!("duplicate range id {}", range.range_id),
                });
            }
            entry.ranges.insert(range.range_id, range);
        }
        Ok(())
    }

    pub fn set_job_state(
        &mut self,
        job_id: &JobId,
        new_state: JobState,
        hpc_substate: Option<String>,
        error_code: Option<i32>,
    ) -> Result<(), DriverError> {
        let entry = self.jobs.get_mut(job_id).ok_or_else(|| DriverError::Unknown {
            reason: format!("set_job_state: job {job_id} not in JobBook"),
        })?;
        entry.job.transition(new_state)?;
        if hpc_substate.is_some() {
            entry.job.hpc_substate = hpc_substate;
        }
        if error_code.is_some() {
            entry.job.error_code = error_code;
        }
        Ok(())
    }

    /// Set `job.coreCount` (spec.md §4.2 step 5, "Core partitioning").
    pub fn set_core_count(&mut self, job_id: &JobId, core_count: u32) -> Result<(), DriverError> {
        let entry = self.jobs.get_mut(job_id).ok_or_else(|| DriverError::Unknown {
            reason: format!("set_core_count: job {job_id} not in JobBook"),
        })?;
        entry.job.core_count = core_count;
        Ok(())
    }

    pub fn set_range_status(
        &mut self,
        job_id: &JobId,
        range_id: &RangeId,
        status: RangeStatus,
    ) -> Result<(), DriverError> {
        // Invariant 1: a range with status != new must have an owning job
        // present. Since every range lives inside its job's entry, this
        // holds by construction as long as callers go through JobBook.
        let entry = self.jobs.get_mut(job_id).ok_or_else(|| DriverError::Unknown {
            reason: format!("set_range_status: job {job_id} not in JobBook"),
        })?;
        let range = entry.ranges.get_mut(range_id).ok_or_else(|| DriverError::Unknown {
            reason: format!("set_range_status: range {range_id} not in job {job_id}"),
        })?;
        range.transition(status)
    }

    /// Force a range straight to `failed`, bypassing the normal
    /// transition chain (spec.md §4.5 retry policy: a range already
    /// `finished` whose stage-out retries are exhausted still needs to
    /// be reportable as failed).
    pub fn force_fail_range(&mut self, job_id: &JobId, range_id: &RangeId) -> Result<(), DriverError> {
        let entry = self.jobs.get_mut(job_id).ok_or_else(|| DriverError::Unknown {
            reason: format!("force_fail_range: job {job_id} not in JobBook"),
        })?;
        let range = entry.ranges.get_mut(range_id).ok_or_else(|| DriverError::Unknown {
            reason: format!("force_fail_range: range {range_id} not in job {job_id}"),
        })?;
        range.force_fail();
        Ok(())
    }

    /// Add `delta` events to `job.nEventsW`, credited when a range the
    /// payload reports as finished is drained (spec.md §4.3 "Finalize").
    pub fn add_events_written(&mut self, job_id: &JobId, delta: u64) -> Result<(), DriverError> {
        let entry = self.jobs.get_mut(job_id).ok_or_else(|| DriverError::Unknown {
            reason: format!("add_events_written: job {job_id} not in JobBook"),
        })?;
        entry.job.n_events_written += delta;
        Ok(())
    }

    /// Set the artifact path/size reported by the PayloadSupervisor for a
    /// range, without changing its status.
    pub fn set_range_artifact(
        &mut self,
        job_id: &JobId,
        range_id: &RangeId,
        path: Option<String>,
        size: Option<u64>,
    ) -> Result<(), DriverError> {
        let entry = self.jobs.get_mut(job_id).ok_or_else(|| DriverError::Unknown {
            reason: format!("set_range_artifact: job {job_id} not in JobBook"),
        })?;
        let range = entry.ranges.get_mut(range_id).ok_or_else(|| DriverError::Unknown {
            reason: format!("set_range_artifact: range {range_id} not in job {job_id}"),
        })?;
        range.artifact_path = path;
        range.artifact_size = size;
        Ok(())
    }

    pub fn ranges_for_job(&self, job_id: &JobId) -> Vec<&EventRange> {
        self.jobs.get(job_id).map(|e| e.ranges.values().collect()).unwrap_or_default()
    }

    pub fn range(&self, job_id: &JobId, range_id: &RangeId) -> Option<&EventRange> {
        self.jobs.get(job_id).and_then(|e| e.ranges.get(range_id))
    }

    pub fn iterate_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values().map(|e| &e.job)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Sum of `coreCount` over jobs currently in `running` state
    /// (invariant 2's left-hand side).
    pub fn running_core_count(&self) -> u32 {
        self.jobs
            .values()
            .filter(|e| e.job.state == JobState::Running)
            .map(|e| e.job.core_count)
            .sum()
    }

    /// Remove a job once all its ranges are `reported`. Fails with
    /// `RangesOutstanding` otherwise (spec.md §4.1).
    pub fn remove(&mut self, job_id: &JobId) -> Result<Job, DriverError> {
        let outstanding = self
            .jobs
            .get(job_id)
            .map(|e| e.ranges.values().any(|r| r.status != RangeStatus::Reported))
            .unwrap_or(false);
        if outstanding {
            return Err(DriverError::RangesOutstanding { job_id: job_id.to_string() });
        }
        self.jobs
            .remove(job_id)
            .map(|e| e.job)
            .ok_or_else(|| DriverError::Unknown { reason: format!("job {job_id} not in JobBook") })
    }

    pub fn snapshot(&self) -> JobBookSnapshot {
        let mut jobs = Vec::with_capacity(self.jobs.len());
        let mut ranges = Vec::new();
        for entry in self.jobs.values() {
            jobs.push(entry.job.clone());
            ranges.extend(entry.ranges.values().cloned());
        }
        JobBookSnapshot { jobs, ranges }
    }

    /// Rebuild a JobBook from a snapshot (the recovery entry point,
    /// spec.md §6's "Recovery entry point"). Re-registers every range ID
    /// so invariant 4 continues to hold across the restart.
    pub fn restore(snapshot: JobBookSnapshot) -> Self {
        let mut book = Self::new();
        for job in snapshot.jobs {
            book.add_job(job);
        }
        for range in snapshot.ranges {
            book.seen_range_ids.insert(range.range_id);
            if let Some(entry) = book.jobs.get_mut(&range.job_id) {
                entry.ranges.insert(range.range_id, range);
            }
        }
        book
    }
}
