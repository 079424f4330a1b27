//! Dispatcher wire DTOs and the sentinel-to-variant translation (spec.md
//! §6, Design Note §9 "String-sentinel protocol responses").
//!
//! The dispatcher's HTTP/JSON replies carry load-bearing sentinel
//! strings in otherwise free-text fields. `esd-adapters` is the only
//! place those strings are matched; everything past that boundary sees
//! [`DispatcherOutcome`] instead.

use serde::{Deserialize, Serialize};

/// Translated outcome of a dispatcher call, replacing raw sentinel
/// strings at the wire boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherOutcome<T> {
    /// The call succeeded with a real payload.
    Ok(T),
    /// "No job received from jobDispatcher" / "Dispatcher has no jobs":
    /// finish cleanly, not an error.
    NoJobsAvailable,
    /// "No more events": proceed with what's already been claimed.
    NoMoreEvents,
    /// A network/5xx-class failure worth retrying (counted towards the
    /// Scheduler's 5-consecutive-failure abort threshold).
    TransientError(String),
    /// A 4xx-class or malformed-response failure that should not be
    /// retried.
    FatalError(String),
}

impl<T> DispatcherOutcome<T> {
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatcherOutcome::TransientError(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRangeDto {
    #[serde(rename = "eventRangeID")]
    pub event_range_id: String,
    #[serde(rename = "LFN")]
    pub lfn: String,
    #[serde(rename = "GUID")]
    pub guid: String,
    pub start_event: u64,
    pub last_event: u64,
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEventRangeEntry {
    #[serde(rename = "eventRangeID")]
    pub event_range_id: String,
    pub event_status: String,
    pub objstore_id: String,
}

/// Dispatcher updates are batched by 100 (spec.md §4.5, "Dispatcher
/// reconciliation").
pub const UPDATE_EVENT_RANGES_BATCH_SIZE: usize = 100;
