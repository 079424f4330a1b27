//! EventRange: the smallest unit of scheduled work (spec.md §3).

use crate::error::DriverError;
use crate::job::JobId;
use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Dispatcher-assigned, globally unique event-range identifier.
    pub struct RangeId("rng-");
}

/// Status of an event range. Transitions are strictly non-decreasing
/// along one of two permitted chains:
///
/// `new -> assigned -> finished -> stagedOut -> reported`
/// `new -> assigned -> failed -> reported`
///
/// No range may skip `reported` on the terminal side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RangeStatus {
    New,
    Assigned,
    Finished,
    Failed,
    StagedOut,
    Reported,
}

crate::simple_display! {
    RangeStatus {
        New => "new",
        Assigned => "assigned",
        Finished => "finished",
        Failed => "failed",
        StagedOut => "stagedOut",
        Reported => "reported",
    }
}

impl RangeStatus {
    /// Whether `self -> next` is one of the two permitted chains.
    pub fn can_transition(self, next: RangeStatus) -> bool {
        use RangeStatus::*;
        matches!(
            (self, next),
            (New, Assigned)
                | (Assigned, Finished)
                | (Assigned, Failed)
                | (Finished, StagedOut)
                | (StagedOut, Reported)
                | (Failed, Reported)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RangeStatus::Reported)
    }

    /// True once the payload has reported an outcome (finished or failed),
    /// i.e. the range is no longer merely claimed.
    pub fn is_payload_terminal(self) -> bool {
        matches!(self, RangeStatus::Finished | RangeStatus::Failed)
    }
}

/// An event-range's owning job and dispatcher-provided file coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRange {
    pub range_id: RangeId,
    pub job_id: JobId,
    pub lfn: String,
    pub guid: String,
    pub start_event: u64,
    pub last_event: u64,
    pub scope: String,
    pub status: RangeStatus,
    /// Set once the payload reports an artifact path for this range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_size: Option<u64>,
}

impl EventRange {
    pub fn new(
        range_id: RangeId,
        job_id: JobId,
        lfn: impl Into<String>,
        guid: impl Into<String>,
        start_event: u64,
        last_event: u64,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            range_id,
            job_id,
            lfn: lfn.into(),
            guid: guid.into(),
            start_event,
            last_event,
            scope: scope.into(),
            status: RangeStatus::New,
            artifact_path: None,
            artifact_size: None,
        }
    }

    /// Validate and apply a status transition. The caller (JobBook) is
    /// the only place this should be invoked from.
    pub fn transition(&mut self, next: RangeStatus) -> Result<(), DriverError> {
        if !self.status.can_transition(next) {
            return Err(DriverError::InvalidTransition {
                entity: format!("range {}", self.range_id),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Force `failed` regardless of the current status, bypassing
    /// `can_transition`. Used when a range's stage-out retries are
    /// exhausted (spec.md §4.5 retry policy): the payload already
    /// reported it `finished`, but it never produced an object-store
    /// copy, so it must still be reportable as a terminal failure.
    pub fn force_fail(&mut self) {
        self.status = RangeStatus::Failed;
    }

    /// Number of events this range covers (inclusive of both ends).
    pub fn event_count(&self) -> u64 {
        self.last_event.saturating_sub(self.start_event) + 1
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;

    pub fn sample_range(job_id: JobId, n: u64) -> EventRange {
        EventRange::new(
            RangeId::from_string(format!("rng-{n:04}")),
            job_id,
            format!("file.{n}.pool.root"),
            format!("GUID-{n:04}"),
            n * 100,
            n * 100 + 99,
            "mc16_13TeV",
        )
    }
}
