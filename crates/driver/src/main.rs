//! esd-driver: the pilot process entry point (spec.md §5).
//!
//! Wires the concrete adapters together, claims and drives one
//! allocation's worth of jobs, and exits with the first fatal pilot
//! error code it observed (spec.md §7).

mod cli;
mod wiring;

use clap::Parser;
use cli::Args;
use esd_core::config::StageoutMode;
use esd_core::dispatcher::UpdateEventRangeEntry;
use esd_core::error::DriverError;
use esd_core::job::{JobId, JobState};
use esd_core::jobbook::JobBook;
use esd_core::range::{RangeId, RangeStatus};
use esd_engine::{Lifecycle, PayloadSupervisor, Scheduler, StageoutPipeline};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(&args.log_filter);

    match run(args).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, code = e.code(), "pilot exiting with a fatal error");
            std::process::exit(e.code());
        }
    }
}

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .init();
}

async fn run(args: Args) -> Result<(), DriverError> {
    std::fs::create_dir_all(&args.workdir)
        .map_err(|e| DriverError::Unknown { reason: format!("creating workdir: {e}") })?;

    let adapters = wiring::build_adapters(&args);
    let site_cfg = adapters
        .site_info
        .catchall()
        .await
        .map_err(|e| DriverError::Unknown { reason: e.to_string() })
        .and_then(|c| {
            esd_core::config::SiteConfig::from_catchall(&c)
                .map_err(|e| DriverError::Unknown { reason: e.to_string() })
        })?;

    let (mut jobbook, mut supervisor) = if args.recover {
        info!(workdir = %args.workdir.display(), "recovering from checkpoint");
        esd_engine::recover(&args.workdir, adapters.hpc_manager.clone()).await?
    } else {
        (JobBook::new(), PayloadSupervisor::new(adapters.hpc_manager.clone()))
    };

    let mut lifecycle = Lifecycle::new(adapters.mover.clone(), adapters.site_info.clone());
    let scheduler = Scheduler::new(adapters.dispatcher.clone());
    let stageout = StageoutPipeline::new(
        adapters.object_store.clone(),
        adapters.site_info.clone(),
        adapters.dispatcher.clone(),
        site_cfg.stageout_mode,
        site_cfg.copy_output_to_global,
        site_cfg.stageout_threads as u32,
    );

    if args.recover {
        requeue_unstaged_ranges_after_recovery(&stageout, &mut jobbook).await;
    }

    if !args.recover {
        let descriptor = wiring::read_job_descriptor(&args.job_def)?;
        let free = supervisor.free_resources().await?;
        let (mut needed_ranges, max_ranges_per_job) = Scheduler::demand_sizing(free, &site_cfg);
        scheduler
            .bootstrap_job(
                &mut jobbook,
                &lifecycle,
                descriptor,
                &mut needed_ranges,
                args.queuedata_file.as_deref(),
            )
            .await?;
        scheduler
            .fill_to_parallel_jobs(
                &mut jobbook,
                &mut lifecycle,
                &mut needed_ranges,
                max_ranges_per_job,
                site_cfg.parallel_jobs.max(1) as u64,
                args.queuedata_file.as_deref(),
            )
            .await?;
        scheduler.stage_in_all(&mut jobbook, &mut lifecycle).await?;
        Scheduler::partition_cores(&mut jobbook, args.total_cores)?;
        scheduler
            .submit_all(
                &mut jobbook,
                &mut lifecycle,
                site_cfg.copy_input_files,
                site_cfg.stageout_threads as u32,
                &supervisor,
            )
            .await?;
    }

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received, finishing the current poll cycle before shutting down");
            watcher.cancel();
        }
    });

    drive_progress_loop(&scheduler, &mut supervisor, &mut jobbook, &stageout, &args.workdir, &cancel).await;

    run_stageout_retry_sweeps(&stageout, &mut jobbook).await;
    checkpoint_jobbook(&jobbook, &args.workdir);

    finalize_all(&lifecycle, &stageout, &mut jobbook).await;

    supervisor.post_run().await;
    let checkpoint = supervisor.save_state().await?;
    for job in jobbook.iterate_jobs() {
        let snapshot = esd_storage::recovery::RecoverySnapshot {
            version: 1,
            job: job.clone(),
            payload_state: serde_json::to_value(&checkpoint)
                .map_err(|e| DriverError::Unknown { reason: e.to_string() })?,
            recovery_attempt: 0,
        };
        esd_storage::recovery::write_snapshot(&args.workdir, &snapshot)
            .map_err(|e| DriverError::Unknown { reason: e.to_string() })?;
    }

    Ok(())
}

/// After a recovery restore, re-drive any per-event range left
/// `finished` but never reached `stagedOut` — e.g. the process was
/// killed between a payload report and its upload, or mid retry sweep
/// (spec.md §4.6 "Recovery entry point"). Ranges that fail again are
/// parked in the stage-out pipeline's retry queue exactly as a live
/// failure would be, so the ordinary sweep mechanism picks them up.
async fn requeue_unstaged_ranges_after_recovery(stageout: &StageoutPipeline, jobbook: &mut JobBook) {
    if stageout.mode() != StageoutMode::PerEvent {
        return;
    }
    let job_ids: Vec<_> = jobbook.iterate_jobs().map(|j| j.id).collect();
    for job_id in job_ids {
        let Some(job) = jobbook.get_job(&job_id).cloned() else { continue };
        let stuck: Vec<_> = jobbook
            .ranges_for_job(&job_id)
            .into_iter()
            .filter(|r| r.status == RangeStatus::Finished && r.artifact_path.is_some())
            .cloned()
            .collect();
        for mut range in stuck {
            let path = range.artifact_path.clone().expect("filtered above");
            match stageout.stage_out_range(&job, &mut range, std::path::Path::new(&path)).await {
                Ok(()) => {
                    let _ = jobbook.set_range_status(&job_id, &range.range_id, RangeStatus::StagedOut);
                    let _ = jobbook.add_events_written(&job_id, range.event_count());
                }
                Err(e) => warn!(job = %job_id, range = %range.range_id, error = %e, "recovered range re-stage-out failed, parked for retry sweeps"),
            }
        }
    }
}

/// Drive one batch of reported `HpcOutput`s through the stage-out
/// pipeline: record the payload's verdict, upload per-event artifacts,
/// and reconcile terminal ranges with the dispatcher (spec.md §4.5).
async fn drain_outputs(
    jobbook: &mut JobBook,
    stageout: &StageoutPipeline,
    outputs: Vec<esd_adapters::hpc_manager::HpcOutput>,
) {
    let mut reconcile_entries = Vec::new();
    for output in outputs {
        let range_id = RangeId::from_string(output.range_id.clone());
        let Some(job_id) = jobbook.iterate_jobs().map(|j| j.id).find(|id| jobbook.range(id, &range_id).is_some()) else {
            warn!(range = %output.range_id, "payload reported an unknown range, ignoring");
            continue;
        };

        let new_status = if output.status == "finished" { RangeStatus::Finished } else { RangeStatus::Failed };
        if let Err(e) = jobbook.set_range_status(&job_id, &range_id, new_status) {
            warn!(job = %job_id, range = %output.range_id, error = %e, "range status update rejected");
            continue;
        }
        let _ = jobbook.set_range_artifact(&job_id, &range_id, output.artifact_path.clone(), None);

        if new_status == RangeStatus::Finished && stageout.mode() == StageoutMode::PerEvent {
            let Some(path) = output.artifact_path.as_deref() else {
                warn!(range = %output.range_id, "finished range reported with no artifact path");
                continue;
            };
            let job = jobbook.get_job(&job_id).expect("job_id just resolved").clone();
            let mut range = jobbook.range(&job_id, &range_id).expect("range_id just resolved").clone();
            let n_events = range.event_count();
            let scope = range.scope.clone();
            match stageout.stage_out_range(&job, &mut range, std::path::Path::new(path)).await {
                Ok(()) => {
                    let _ = jobbook.set_range_status(&job_id, &range_id, RangeStatus::StagedOut);
                    let _ = jobbook.add_events_written(&job_id, n_events);
                    let bucket_id = stageout.bucket_id_for(&scope).await.unwrap_or_default();
                    reconcile_entries.push(UpdateEventRangeEntry {
                        event_range_id: output.range_id.clone(),
                        event_status: "finished".into(),
                        objstore_id: bucket_id,
                    });
                }
                Err(e) => warn!(range = %output.range_id, error = %e, "stage-out failed, parked for retry sweeps"),
            }
        } else if new_status == RangeStatus::Failed {
            reconcile_entries.push(UpdateEventRangeEntry {
                event_range_id: output.range_id.clone(),
                event_status: "failed".into(),
                objstore_id: String::new(),
            });
        }
    }

    if !reconcile_entries.is_empty() {
        match stageout.reconcile(&reconcile_entries).await {
            Ok(()) => {
                for entry in &reconcile_entries {
                    let range_id = RangeId::from_string(entry.event_range_id.clone());
                    if let Some(job_id) = jobbook.iterate_jobs().map(|j| j.id).find(|id| jobbook.range(id, &range_id).is_some()) {
                        let _ = jobbook.set_range_status(&job_id, &range_id, RangeStatus::Reported);
                    }
                }
            }
            Err(e) => warn!(error = %e, "dispatcher reconciliation failed, ranges remain unreported"),
        }
    }
}

/// Retry every stage-out upload parked by [`drain_outputs`], up to 3
/// sweeps (spec.md §4.5 "Retry policy": one initial attempt plus 3 retry
/// sweeps, matching `MAX_STAGEOUT_ATTEMPTS`). A range that still fails
/// after the last sweep is forced to `failed` (bypassing the normal
/// `finished -> failed` prohibition, since the payload already reported
/// it finished) and reconciled with the dispatcher as such, so it can
/// reach `reported` and stop blocking its job's finalize.
async fn run_stageout_retry_sweeps(stageout: &StageoutPipeline, jobbook: &mut JobBook) {
    for sweep in 1..=3u32 {
        if !stageout.has_pending_stageouts() {
            break;
        }
        let outcomes = stageout.retry_failed_stageouts().await;
        if outcomes.is_empty() {
            continue;
        }
        let mut entries = Vec::with_capacity(outcomes.len());
        for outcome in &outcomes {
            if outcome.succeeded {
                let _ = jobbook.set_range_status(&outcome.job_id, &outcome.range_id, RangeStatus::StagedOut);
                let _ = jobbook.add_events_written(&outcome.job_id, outcome.n_events);
            } else if let Err(e) = jobbook.force_fail_range(&outcome.job_id, &outcome.range_id) {
                warn!(job = %outcome.job_id, range = %outcome.range_id, error = %e, "could not force-fail an exhausted range");
            }
            entries.push(UpdateEventRangeEntry {
                event_range_id: outcome.range_id.to_string(),
                event_status: if outcome.succeeded { "finished".into() } else { "failed".into() },
                objstore_id: outcome.objstore_id.clone(),
            });
        }
        match stageout.reconcile(&entries).await {
            Ok(()) => {
                for outcome in &outcomes {
                    let _ = jobbook.set_range_status(&outcome.job_id, &outcome.range_id, RangeStatus::Reported);
                }
            }
            Err(e) => warn!(sweep, error = %e, "stage-out retry-sweep reconciliation failed, ranges remain unresolved"),
        }
        info!(sweep, retried = outcomes.len(), "stage-out retry sweep complete");
    }
}

/// Finalize every job whose ranges have all reached `reported` (spec.md
/// §4.3 "Finalize"). In zip mode, package and upload the job's premerge
/// tar first, then reconcile every range it covers. Jobs still
/// mid-flight (e.g. the loop was cancelled early) are left for the next
/// recovery pass.
async fn finalize_all(lifecycle: &Lifecycle, stageout: &StageoutPipeline, jobbook: &mut JobBook) {
    let job_ids: Vec<_> = jobbook.iterate_jobs().map(|j| j.id).collect();
    for job_id in job_ids {
        let Some(job) = jobbook.get_job(&job_id) else { continue };
        if job.state.is_terminal() {
            continue;
        }
        let workdir = job.workdir.clone();

        if stageout.mode() == StageoutMode::Zip {
            match stageout.stage_out_zip(&workdir, &job_id.to_string()).await {
                Ok((manifest, bucket_id)) => {
                    let mut entries = Vec::with_capacity(manifest.len());
                    for line in manifest {
                        if line.status == "finished" {
                            if let Some(range) = jobbook.range(&job_id, &line.range_id) {
                                let n_events = range.event_count();
                                let _ = jobbook.add_events_written(&job_id, n_events);
                            }
                        }
                        let _ = jobbook.set_range_status(&job_id, &line.range_id, RangeStatus::StagedOut);
                        entries.push(UpdateEventRangeEntry {
                            event_range_id: line.range_id.to_string(),
                            event_status: line.status,
                            objstore_id: bucket_id.clone(),
                        });
                    }
                    if let Err(e) = stageout.reconcile(&entries).await {
                        warn!(job = %job_id, error = %e, "zip-mode reconciliation failed");
                    } else {
                        for entry in &entries {
                            let range_id = RangeId::from_string(entry.event_range_id.clone());
                            let _ = jobbook.set_range_status(&job_id, &range_id, RangeStatus::Reported);
                        }
                    }
                }
                Err(e) => warn!(job = %job_id, error = %e, "zip-mode stage-out failed"),
            }
        }

        sweep_unresolved_ranges(stageout, jobbook, &job_id).await;

        let ranges: Vec<esd_core::range::EventRange> =
            jobbook.ranges_for_job(&job_id).into_iter().cloned().collect();
        if ranges.is_empty() || !ranges.iter().all(|r| r.status.is_terminal()) {
            continue;
        }

        if let Err(e) = jobbook.set_job_state(&job_id, JobState::StagingOut, None, None) {
            warn!(job = %job_id, error = %e, "could not move job to stagingOut");
            continue;
        }
        let mut job = jobbook.get_job(&job_id).expect("job_id just resolved").clone();
        let range_refs: Vec<&esd_core::range::EventRange> = ranges.iter().collect();
        if let Err(e) = lifecycle.finalize(&mut job, &range_refs) {
            warn!(job = %job_id, error = %e, "finalize failed");
            continue;
        }
        let _ = jobbook.set_job_state(&job_id, job.state, job.hpc_substate.clone(), job.error_code);
    }
}

/// Ranges the payload never reported a terminal event for by the time
/// its job reaches finalize — reported `failed` with no artifact, since
/// nothing was ever uploaded for them (spec.md §4.3 "Finalize", §8
/// scenario 6 "oversubscribed job"). `new` ranges never occur here: a
/// claimed range is assigned to the payload the moment it's admitted to
/// the JobBook.
async fn sweep_unresolved_ranges(stageout: &StageoutPipeline, jobbook: &mut JobBook, job_id: &JobId) {
    let stuck: Vec<RangeId> = jobbook
        .ranges_for_job(job_id)
        .into_iter()
        .filter(|r| r.status == RangeStatus::Assigned)
        .map(|r| r.range_id)
        .collect();
    if stuck.is_empty() {
        return;
    }
    let entries: Vec<UpdateEventRangeEntry> = stuck
        .iter()
        .map(|range_id| UpdateEventRangeEntry {
            event_range_id: range_id.to_string(),
            event_status: "failed".into(),
            objstore_id: String::new(),
        })
        .collect();
    match stageout.reconcile(&entries).await {
        Ok(()) => {
            for range_id in &stuck {
                let _ = jobbook.set_range_status(job_id, range_id, RangeStatus::Failed);
                let _ = jobbook.set_range_status(job_id, range_id, RangeStatus::Reported);
            }
        }
        Err(e) => warn!(job = %job_id, error = %e, "could not reconcile unresolved ranges"),
    }
}

async fn drive_progress_loop(
    scheduler: &Scheduler,
    supervisor: &mut PayloadSupervisor,
    jobbook: &mut JobBook,
    stageout: &StageoutPipeline,
    workdir: &std::path::Path,
    cancel: &CancellationToken,
) {
    let mut since_heartbeat = std::time::Duration::ZERO;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(esd_engine::scheduler::POLL_INTERVAL) => {}
            _ = cancel.cancelled() => {
                warn!("progress loop cancelled");
                break;
            }
        }
        let _ = supervisor.poll().await;
        let outputs = supervisor.get_outputs().await;
        if !outputs.is_empty() {
            drain_outputs(jobbook, stageout, outputs).await;
            checkpoint_jobbook(jobbook, workdir);
        }
        since_heartbeat += esd_engine::scheduler::POLL_INTERVAL;
        if since_heartbeat >= esd_engine::scheduler::HEARTBEAT_INTERVAL {
            scheduler.heartbeat_all(jobbook).await;
            since_heartbeat = std::time::Duration::ZERO;
        }
        if supervisor.is_finished().await {
            info!("payload supervisor reports finished");
            break;
        }
    }
    let remaining = supervisor.flush_outputs().await;
    if !remaining.is_empty() {
        drain_outputs(jobbook, stageout, remaining).await;
        checkpoint_jobbook(jobbook, workdir);
    }
}

/// Refresh the whole-book recovery snapshot so a hard kill between here
/// and the next drain only loses the ranges that haven't reached
/// `stagedOut` yet (spec.md §4.6 "Recovery entry point").
fn checkpoint_jobbook(jobbook: &JobBook, workdir: &std::path::Path) {
    if let Err(e) = esd_storage::jobbook_snapshot::write(workdir, &jobbook.snapshot()) {
        warn!(error = %e, "failed to checkpoint jobbook snapshot");
    }
}
