//! Dispatcher client (spec.md §6): claim jobs, claim ranges, push
//! heartbeats, reconcile terminal range statuses. Out of scope per
//! spec.md §1 beyond this trait — the wire format below is deliberately
//! the minimum needed to drive the state machines in `esd-engine`.

use async_trait::async_trait;
use esd_core::dispatcher::{DispatcherOutcome, EventRangeDto, UpdateEventRangeEntry};
use esd_core::job::JobDescriptor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatcherClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait DispatcherClient: Send + Sync {
    /// Claim up to `n_jobs` job descriptors.
    async fn get_job(
        &self,
        n_jobs: u32,
    ) -> Result<DispatcherOutcome<Vec<JobDescriptor>>, DispatcherClientError>;

    /// Post a heartbeat for `job_id`: state string and exit code (if the
    /// job has finished).
    async fn update_job(
        &self,
        job_id: &str,
        state: &str,
        exit_code: Option<i32>,
    ) -> Result<DispatcherOutcome<()>, DispatcherClientError>;

    /// Claim up to `num_ranges` event ranges for `job_id`.
    async fn download_event_ranges(
        &self,
        job_id: &str,
        jobset_id: &str,
        task_id: &str,
        num_ranges: u32,
    ) -> Result<DispatcherOutcome<Vec<EventRangeDto>>, DispatcherClientError>;

    /// Acknowledge terminal range statuses, already batched by the
    /// caller to at most [`esd_core::dispatcher::UPDATE_EVENT_RANGES_BATCH_SIZE`].
    async fn update_event_ranges(
        &self,
        updates: &[UpdateEventRangeEntry],
    ) -> Result<DispatcherOutcome<()>, DispatcherClientError>;
}

/// Translate a raw response body into a [`DispatcherOutcome`], matching
/// the sentinel strings spec.md §6 calls load-bearing.
pub fn classify_body<T>(body: &str, parsed: Option<T>) -> DispatcherOutcome<T> {
    if body.contains("No job received from jobDispatcher") || body.contains("Dispatcher has no jobs") {
        return DispatcherOutcome::NoJobsAvailable;
    }
    if body.contains("No more events") {
        return DispatcherOutcome::NoMoreEvents;
    }
    match parsed {
        Some(value) => DispatcherOutcome::Ok(value),
        None => DispatcherOutcome::FatalError(format!("unrecognized dispatcher response: {body}")),
    }
}

/// HTTP/JSON dispatcher client (spec.md §6, "Dispatcher (HTTP/JSON)").
pub struct HttpDispatcherClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpDispatcherClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), http: reqwest::Client::new() }
    }

    async fn post_text(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<String, DispatcherClientError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let resp = self
            .http
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| DispatcherClientError::Transport(e.to_string()))?;
        resp.text().await.map_err(|e| DispatcherClientError::Transport(e.to_string()))
    }
}

#[async_trait]
impl DispatcherClient for HttpDispatcherClient {
    async fn get_job(
        &self,
        n_jobs: u32,
    ) -> Result<DispatcherOutcome<Vec<JobDescriptor>>, DispatcherClientError> {
        let body = self.post_text("getJob", &[("nJobs", n_jobs.to_string())]).await?;
        let parsed = serde_json::from_str::<Vec<JobDescriptor>>(&body).ok();
        Ok(classify_body(&body, parsed))
    }

    async fn update_job(
        &self,
        job_id: &str,
        state: &str,
        exit_code: Option<i32>,
    ) -> Result<DispatcherOutcome<()>, DispatcherClientError> {
        let body = self
            .post_text(
                "updateJob",
                &[
                    ("jobId", job_id.to_string()),
                    ("state", state.to_string()),
                    ("exitCode", exit_code.map(|c| c.to_string()).unwrap_or_default()),
                ],
            )
            .await?;
        Ok(classify_body(&body, Some(())))
    }

    async fn download_event_ranges(
        &self,
        job_id: &str,
        jobset_id: &str,
        task_id: &str,
        num_ranges: u32,
    ) -> Result<DispatcherOutcome<Vec<EventRangeDto>>, DispatcherClientError> {
        let body = self
            .post_text(
                "getEventRanges",
                &[
                    ("pandaID", job_id.to_string()),
                    ("jobsetID", jobset_id.to_string()),
                    ("taskID", task_id.to_string()),
                    ("nRanges", num_ranges.to_string()),
                ],
            )
            .await?;
        let parsed = serde_json::from_str::<Vec<EventRangeDto>>(&body).ok();
        Ok(classify_body(&body, parsed))
    }

    async fn update_event_ranges(
        &self,
        updates: &[UpdateEventRangeEntry],
    ) -> Result<DispatcherOutcome<()>, DispatcherClientError> {
        let payload = serde_json::to_string(updates)
            .map_err(|e| DispatcherClientError::Malformed(e.to_string()))?;
        let body = self.post_text("updateEventRanges", &[("eventRanges", payload)]).await?;
        Ok(classify_body(&body, Some(())))
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// In-memory dispatcher used by `esd-engine`'s tests and the
    /// scenario tests in `tests/specs.rs` (spec.md §8).
    #[derive(Default)]
    pub struct FakeDispatcher {
        pub job_batches: Mutex<VecDeque<DispatcherOutcome<Vec<JobDescriptor>>>>,
        pub range_batches: Mutex<VecDeque<DispatcherOutcome<Vec<EventRangeDto>>>>,
        pub job_updates: Mutex<Vec<(String, String, Option<i32>)>>,
        pub range_updates: Mutex<Vec<UpdateEventRangeEntry>>,
    }

    impl FakeDispatcher {
        pub fn push_jobs(&self, outcome: DispatcherOutcome<Vec<JobDescriptor>>) {
            self.job_batches.lock().push_back(outcome);
        }

        pub fn push_ranges(&self, outcome: DispatcherOutcome<Vec<EventRangeDto>>) {
            self.range_batches.lock().push_back(outcome);
        }
    }

    #[async_trait]
    impl DispatcherClient for FakeDispatcher {
        async fn get_job(
            &self,
            _n_jobs: u32,
        ) -> Result<DispatcherOutcome<Vec<JobDescriptor>>, DispatcherClientError> {
            Ok(self.job_batches.lock().pop_front().unwrap_or(DispatcherOutcome::NoJobsAvailable))
        }

        async fn update_job(
            &self,
            job_id: &str,
            state: &str,
            exit_code: Option<i32>,
        ) -> Result<DispatcherOutcome<()>, DispatcherClientError> {
            self.job_updates.lock().push((job_id.to_string(), state.to_string(), exit_code));
            Ok(DispatcherOutcome::Ok(()))
        }

        async fn download_event_ranges(
            &self,
            _job_id: &str,
            _jobset_id: &str,
            _task_id: &str,
            _num_ranges: u32,
        ) -> Result<DispatcherOutcome<Vec<EventRangeDto>>, DispatcherClientError> {
            Ok(self.range_batches.lock().pop_front().unwrap_or(DispatcherOutcome::NoMoreEvents))
        }

        async fn update_event_ranges(
            &self,
            updates: &[UpdateEventRangeEntry],
        ) -> Result<DispatcherOutcome<()>, DispatcherClientError> {
            self.range_updates.lock().extend_from_slice(updates);
            Ok(DispatcherOutcome::Ok(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_no_jobs_sentinel() {
        let outcome: DispatcherOutcome<Vec<JobDescriptor>> =
            classify_body("Dispatcher has no jobs", None);
        assert_eq!(outcome, DispatcherOutcome::NoJobsAvailable);
    }

    #[test]
    fn classifies_no_more_events_sentinel() {
        let outcome: DispatcherOutcome<Vec<EventRangeDto>> = classify_body("No more events", None);
        assert_eq!(outcome, DispatcherOutcome::NoMoreEvents);
    }

    #[test]
    fn falls_back_to_fatal_on_unparseable_body() {
        let outcome: DispatcherOutcome<Vec<JobDescriptor>> = classify_body("<html>502</html>", None);
        assert!(matches!(outcome, DispatcherOutcome::FatalError(_)));
    }
}
