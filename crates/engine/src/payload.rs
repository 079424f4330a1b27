//! PayloadSupervisor: thin driving logic wrapping the `HpcManager`
//! control surface (spec.md §4.4). Single-reader: only the Scheduler
//! polls it and reads its outputs.

use esd_adapters::hpc_manager::{HpcJobSpec, HpcJobState, HpcManager, HpcManagerCheckpoint, HpcOutput};
use esd_core::error::DriverError;
use std::collections::HashMap;
use std::sync::Arc;

pub struct PayloadSupervisor {
    manager: Arc<dyn HpcManager>,
    poll_failures: u32,
}

impl PayloadSupervisor {
    pub fn new(manager: Arc<dyn HpcManager>) -> Self {
        Self { manager, poll_failures: 0 }
    }

    pub async fn free_resources(&self) -> Result<esd_adapters::hpc_manager::FreeResources, DriverError> {
        self.manager.free_resources().await
    }

    pub async fn init_and_submit(
        &self,
        jobs: &[HpcJobSpec],
        ranges_by_job: &HashMap<String, Vec<String>>,
    ) -> Result<(), DriverError> {
        self.manager.init_jobs(jobs, ranges_by_job).await?;
        self.manager.submit().await
    }

    /// Failed polls are retried; repeated failures are logged but never
    /// fatal (spec.md §4.4).
    pub async fn poll(&mut self) -> Option<HpcJobState> {
        match self.manager.poll().await {
            Ok(state) => {
                self.poll_failures = 0;
                Some(state)
            }
            Err(e) => {
                self.poll_failures += 1;
                tracing::warn!(error = %e, consecutive_failures = self.poll_failures, "payload poll failed");
                None
            }
        }
    }

    pub async fn is_finished(&self) -> bool {
        self.manager.is_finished().await.unwrap_or(false)
    }

    pub async fn get_outputs(&self) -> Vec<HpcOutput> {
        self.manager.get_outputs().await.unwrap_or_default()
    }

    pub async fn flush_outputs(&self) -> Vec<HpcOutput> {
        self.manager.flush_outputs().await.unwrap_or_default()
    }

    pub async fn post_run(&self) {
        if let Err(e) = self.manager.post_run().await {
            tracing::warn!(error = %e, "postRun failed, continuing to finalize anyway");
        }
    }

    pub async fn save_state(&self) -> Result<HpcManagerCheckpoint, DriverError> {
        self.manager.save_state().await
    }

    pub async fn recovery_state(&self, checkpoint: HpcManagerCheckpoint) -> Result<(), DriverError> {
        self.manager.recovery_state(checkpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esd_adapters::hpc_manager::{fake::FakeHpcManager, FreeResources};

    #[tokio::test]
    async fn poll_failure_never_panics_and_is_counted() {
        // FakeHpcManager never errors; this exercises the happy path of
        // the retry-counting wrapper.
        let mgr = Arc::new(FakeHpcManager::new(FreeResources {
            nodes: 1,
            cores: 4,
            walltime_s: 100,
            events_capacity: 100,
        }));
        let mut supervisor = PayloadSupervisor::new(mgr);
        let state = supervisor.poll().await;
        assert!(state.is_some());
    }
}
