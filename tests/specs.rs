//! End-to-end scenario tests for the pilot driver's orchestration loop,
//! composed entirely from `esd-engine`'s public surface and the
//! `esd-adapters` fakes — the same seam the production `esd-driver`
//! binary wires its adapters through.
//!
//! `drain_outputs`/`sweep_unresolved_ranges` below mirror
//! `esd-driver::main`'s private functions of the same name; they aren't
//! importable from a binary crate, so the scenarios re-drive the same
//! sequence of public `JobBook`/`StageoutPipeline`/`Lifecycle` calls.

use esd_adapters::dispatcher::fake::FakeDispatcher;
use esd_adapters::hpc_manager::{fake::FakeHpcManager, FreeResources, HpcOutput};
use esd_adapters::{FakeMover, FakeObjectStore, FakeSiteInfo};
use esd_core::config::StageoutMode;
use esd_core::dispatcher::UpdateEventRangeEntry;
use esd_core::error::DriverError;
use esd_core::job::{InputFile, JobBuilder, JobId, JobState};
use esd_core::jobbook::JobBook;
use esd_core::range::{EventRange, RangeId, RangeStatus};
use esd_engine::{recover, Lifecycle, Scheduler, StageoutPipeline};
use std::sync::Arc;

fn assigned_range(job_id: JobId, n: u64, start_event: u64, last_event: u64) -> EventRange {
    let mut range = EventRange::new(
        RangeId::from_string(format!("rng-{n:04}")),
        job_id,
        format!("file.{n}.pool.root"),
        format!("GUID-{n:04}"),
        start_event,
        last_event,
        "mc16_13TeV",
    );
    range.transition(RangeStatus::Assigned).unwrap();
    range
}

/// Mirrors `esd-driver::main::drain_outputs`: record the payload's
/// verdict for each range, stage finished per-event artifacts out, and
/// reconcile terminal ranges with the dispatcher.
async fn drain_outputs(jobbook: &mut JobBook, stageout: &StageoutPipeline, outputs: Vec<HpcOutput>) {
    let mut reconcile_entries = Vec::new();
    for output in outputs {
        let range_id = RangeId::from_string(output.range_id.clone());
        let Some(job_id) =
            jobbook.iterate_jobs().map(|j| j.id).find(|id| jobbook.range(id, &range_id).is_some())
        else {
            continue;
        };

        let new_status = if output.status == "finished" { RangeStatus::Finished } else { RangeStatus::Failed };
        if jobbook.set_range_status(&job_id, &range_id, new_status).is_err() {
            continue;
        }
        let _ = jobbook.set_range_artifact(&job_id, &range_id, output.artifact_path.clone(), None);

        if new_status == RangeStatus::Finished && stageout.mode() == StageoutMode::PerEvent {
            let Some(path) = output.artifact_path.as_deref() else { continue };
            let job = jobbook.get_job(&job_id).unwrap().clone();
            let mut range = jobbook.range(&job_id, &range_id).unwrap().clone();
            let n_events = range.last_event.saturating_sub(range.start_event) + 1;
            let scope = range.scope.clone();
            if stageout.stage_out_range(&job, &mut range, std::path::Path::new(path)).await.is_ok() {
                let _ = jobbook.set_range_status(&job_id, &range_id, RangeStatus::StagedOut);
                let _ = jobbook.add_events_written(&job_id, n_events);
                let bucket_id = stageout.bucket_id_for(&scope).await.unwrap_or_default();
                reconcile_entries.push(UpdateEventRangeEntry {
                    event_range_id: output.range_id.clone(),
                    event_status: "finished".into(),
                    objstore_id: bucket_id,
                });
            }
        } else if new_status == RangeStatus::Failed {
            reconcile_entries.push(UpdateEventRangeEntry {
                event_range_id: output.range_id.clone(),
                event_status: "failed".into(),
                objstore_id: String::new(),
            });
        }
    }

    if !reconcile_entries.is_empty() && stageout.reconcile(&reconcile_entries).await.is_ok() {
        for entry in &reconcile_entries {
            let range_id = RangeId::from_string(entry.event_range_id.clone());
            if let Some(job_id) =
                jobbook.iterate_jobs().map(|j| j.id).find(|id| jobbook.range(id, &range_id).is_some())
            {
                let _ = jobbook.set_range_status(&job_id, &range_id, RangeStatus::Reported);
            }
        }
    }
}

/// Mirrors `esd-driver::main::sweep_unresolved_ranges`: ranges the
/// payload never reported an outcome for are reported `failed` with no
/// artifact, so finalize's terminal check can still pass.
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
    if stageout.reconcile(&entries).await.is_ok() {
        for range_id in &stuck {
            let _ = jobbook.set_range_status(job_id, range_id, RangeStatus::Failed);
            let _ = jobbook.set_range_status(job_id, range_id, RangeStatus::Reported);
        }
    }
}

/// Drive a job through `stagingOut -> finalize`, assuming every one of
/// its ranges has already reached a terminal status.
fn finalize_job(lifecycle: &Lifecycle, jobbook: &mut JobBook, job_id: &JobId) {
    jobbook.set_job_state(job_id, JobState::StagingOut, None, None).unwrap();
    let mut job = jobbook.get_job(job_id).unwrap().clone();
    let ranges: Vec<EventRange> = jobbook.ranges_for_job(job_id).into_iter().cloned().collect();
    let range_refs: Vec<&EventRange> = ranges.iter().collect();
    lifecycle.finalize(&mut job, &range_refs).unwrap();
    jobbook.set_job_state(job_id, job.state, job.hpc_substate.clone(), job.error_code).unwrap();
}

/// Scenario 1 (spec.md §8): one job, four single-event ranges, three
/// finished and one failed. Per-event stage-out uploads exactly the
/// three finished artifacts; the job finalizes `finished` with
/// `nEventsW == 3`.
#[tokio::test]
async fn scenario_1_mixed_finished_and_failed_ranges_finalize_to_finished() {
    let dispatcher = Arc::new(FakeDispatcher::default());
    let site_info = Arc::new(FakeSiteInfo::new(""));
    let object_store = Arc::new(FakeObjectStore::default());
    let mover = Arc::new(FakeMover::default());
    let stageout =
        StageoutPipeline::new(object_store.clone(), site_info.clone(), dispatcher.clone(), StageoutMode::PerEvent, false, 4);
    let lifecycle = Lifecycle::new(mover, site_info);

    let job = JobBuilder::default()
        .state(JobState::Running)
        .input_files(vec![
            InputFile { lfn: "a.pool.root".into(), guid: "guid-a".into(), size: 1, checksum: "x".into() },
            InputFile { lfn: "b.pool.root".into(), guid: "guid-b".into(), size: 1, checksum: "x".into() },
            InputFile { lfn: "c.pool.root".into(), guid: "guid-c".into(), size: 1, checksum: "x".into() },
        ])
        .build();
    let job_id = job.id;
    let mut jobbook = JobBook::new();
    jobbook.add_job(job);
    jobbook
        .add_ranges(
            job_id,
            vec![
                assigned_range(job_id, 1, 0, 0),
                assigned_range(job_id, 2, 1, 1),
                assigned_range(job_id, 3, 2, 2),
                assigned_range(job_id, 4, 3, 3),
            ],
        )
        .unwrap();

    let outputs = vec![
        HpcOutput { range_id: "rng-0001".into(), status: "finished".into(), artifact_path: Some("/tmp/out1.root".into()) },
        HpcOutput { range_id: "rng-0002".into(), status: "finished".into(), artifact_path: Some("/tmp/out2.root".into()) },
        HpcOutput { range_id: "rng-0003".into(), status: "finished".into(), artifact_path: Some("/tmp/out3.root".into()) },
        HpcOutput { range_id: "rng-0004".into(), status: "failed".into(), artifact_path: None },
    ];
    drain_outputs(&mut jobbook, &stageout, outputs).await;

    assert_eq!(object_store.uploads.lock().len(), 3);
    assert_eq!(dispatcher.range_updates.lock().len(), 4);
    assert!(jobbook.ranges_for_job(&job_id).iter().all(|r| r.status == RangeStatus::Reported));

    finalize_job(&lifecycle, &mut jobbook, &job_id);

    let job = jobbook.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Finished);
    assert_eq!(job.n_events_written, 3);
}

/// Scenario 2 (spec.md §8): zip-mode stage-out packages four finished
/// lines' artifacts into one tar and uploads it once; the manifest still
/// lists the fifth, failed, line with no tar entry, and every range
/// reconciles under the same bucket ID the tar was uploaded to.
#[tokio::test]
async fn scenario_2_zip_mode_packages_one_tar_and_reconciles_every_range() {
    let dispatcher = Arc::new(FakeDispatcher::default());
    let site_info = Arc::new(FakeSiteInfo::new(""));
    let object_store = Arc::new(FakeObjectStore::default());
    let stageout =
        StageoutPipeline::new(object_store.clone(), site_info, dispatcher.clone(), StageoutMode::Zip, false, 4);

    let dir = tempfile::tempdir().unwrap();
    let job_id = JobId::from_string("job-zip0001");

    let mut jobbook = JobBook::new();
    jobbook.add_job(esd_core::job::Job::new(job_id, dir.path().to_path_buf(), vec![], vec![], "athena.py", "prodUser"));

    let ranges: Vec<EventRange> = (1..=5).map(|n| assigned_range(job_id, n, n - 1, n - 1)).collect();
    jobbook.add_ranges(job_id, ranges).unwrap();

    for n in 1..=4u64 {
        std::fs::write(dir.path().join(format!("out-{n}.root")), b"payload-bytes").unwrap();
    }
    let dump_path = esd_storage::event_dump::dump_path(dir.path(), &job_id.to_string());
    let dump = format!(
        "{job} rng-0001 finished out-1.root,log.txt,meta.json,stats.json\n\
         {job} rng-0002 finished out-2.root,log.txt,meta.json,stats.json\n\
         {job} rng-0003 finished out-3.root,log.txt,meta.json,stats.json\n\
         {job} rng-0004 finished out-4.root,log.txt,meta.json,stats.json\n\
         {job} rng-0005 failed \n",
        job = job_id
    );
    std::fs::write(&dump_path, dump).unwrap();

    let (manifest, bucket_id) = stageout.stage_out_zip(dir.path(), &job_id.to_string()).await.unwrap();
    assert_eq!(manifest.len(), 5);
    assert_eq!(object_store.uploads.lock().len(), 1);

    let tar_path = dir.path().join(format!("EventService_premerge_{job_id}.tar"));
    let tar_file = std::fs::File::open(&tar_path).unwrap();
    let mut archive = tar::Archive::new(tar_file);
    let entry_count = archive.entries().unwrap().count();
    assert_eq!(entry_count, 4);

    let mut entries = Vec::with_capacity(manifest.len());
    for line in &manifest {
        if line.status == "finished" {
            if let Some(range) = jobbook.range(&job_id, &line.range_id) {
                let n_events = range.last_event.saturating_sub(range.start_event) + 1;
                jobbook.add_events_written(&job_id, n_events).unwrap();
            }
        }
        jobbook.set_range_status(&job_id, &line.range_id, RangeStatus::StagedOut).unwrap();
        entries.push(UpdateEventRangeEntry {
            event_range_id: line.range_id.to_string(),
            event_status: line.status.clone(),
            objstore_id: bucket_id.clone(),
        });
    }
    stageout.reconcile(&entries).await.unwrap();
    for entry in &entries {
        let range_id = RangeId::from_string(entry.event_range_id.clone());
        jobbook.set_range_status(&job_id, &range_id, RangeStatus::Reported).unwrap();
    }

    assert_eq!(dispatcher.range_updates.lock().len(), 5);
    assert!(dispatcher.range_updates.lock().iter().all(|u| u.objstore_id == bucket_id));
    assert_eq!(jobbook.get_job(&job_id).unwrap().n_events_written, 4);
    assert!(jobbook.ranges_for_job(&job_id).iter().all(|r| r.status == RangeStatus::Reported));
}

/// Scenario 3 (spec.md §8): the dispatcher's job queue is already
/// exhausted when the fill loop starts. No job is claimed, no error is
/// raised, and finalize over the (empty) JobBook is a clean no-op.
#[tokio::test]
async fn scenario_3_exhausted_dispatcher_queue_is_not_an_error() {
    let dispatcher = Arc::new(FakeDispatcher::default());
    let scheduler = Scheduler::new(dispatcher.clone());
    let mut lifecycle = Lifecycle::new(Arc::new(FakeMover::default()), Arc::new(FakeSiteInfo::new("")));
    let mut jobbook = JobBook::new();
    let mut needed = 50u64;

    let result = scheduler.fill_to_parallel_jobs(&mut jobbook, &mut lifecycle, &mut needed, 10, 5, None).await;

    assert!(result.is_ok());
    assert_eq!(jobbook.job_count(), 0);
    assert!(dispatcher.job_updates.lock().is_empty());
}

/// Scenario 4 (spec.md §8): of two jobs, one fails stage-in. It is
/// dropped from the JobBook and reported failed to the dispatcher before
/// core partitioning runs, so the surviving job receives the full core
/// count rather than an even split.
#[tokio::test]
async fn scenario_4_stage_in_failure_is_dropped_before_core_partitioning() {
    let dispatcher = Arc::new(FakeDispatcher::default());
    let scheduler = Scheduler::new(dispatcher.clone());
    let mover = Arc::new(FakeMover::default());
    mover.fail_lfns.lock().insert("bad.pool.root".to_string());
    let mut lifecycle = Lifecycle::new(mover, Arc::new(FakeSiteInfo::new("")));

    let job_a = JobBuilder::default().state(JobState::Transferring).build();
    let job_b = JobBuilder::default()
        .state(JobState::Transferring)
        .input_files(vec![InputFile {
            lfn: "bad.pool.root".into(),
            guid: "guid-bad".into(),
            size: 1,
            checksum: "x".into(),
        }])
        .build();
    let job_a_id = job_a.id;
    let job_b_id = job_b.id;

    let mut jobbook = JobBook::new();
    jobbook.add_job(job_a);
    jobbook.add_job(job_b);

    scheduler.stage_in_all(&mut jobbook, &mut lifecycle).await.unwrap();

    assert!(jobbook.contains_job(&job_a_id));
    assert!(!jobbook.contains_job(&job_b_id));
    assert_eq!(jobbook.get_job(&job_a_id).unwrap().state, JobState::Running);
    assert!(dispatcher
        .job_updates
        .lock()
        .iter()
        .any(|(id, state, _)| id == &job_b_id.to_string() && state == "failed"));

    Scheduler::partition_cores(&mut jobbook, 8).unwrap();
    assert_eq!(jobbook.get_job(&job_a_id).unwrap().core_count, 8);
}

/// Scenario 5 (spec.md §8): a hard kill between two drains loses nothing
/// but in-flight work. The whole-book snapshot taken right before the
/// kill carries all four claimed ranges (two already reported, two still
/// assigned) forward through `recover`, and the same dispatcher sees all
/// four terminal updates by the end of the run.
#[tokio::test]
async fn scenario_5_recovery_resumes_unfinished_ranges_from_the_jobbook_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = Arc::new(FakeDispatcher::default());
    let site_info = Arc::new(FakeSiteInfo::new(""));
    let object_store = Arc::new(FakeObjectStore::default());
    let stageout =
        StageoutPipeline::new(object_store.clone(), site_info, dispatcher.clone(), StageoutMode::PerEvent, false, 4);

    let job = JobBuilder::default().state(JobState::Running).build();
    let job_id = job.id;
    let mut jobbook = JobBook::new();
    jobbook.add_job(job);
    jobbook
        .add_ranges(
            job_id,
            vec![
                assigned_range(job_id, 1, 0, 0),
                assigned_range(job_id, 2, 1, 1),
                assigned_range(job_id, 3, 2, 2),
                assigned_range(job_id, 4, 3, 3),
            ],
        )
        .unwrap();

    let before_kill = vec![
        HpcOutput { range_id: "rng-0001".into(), status: "finished".into(), artifact_path: Some("/tmp/r1.root".into()) },
        HpcOutput { range_id: "rng-0002".into(), status: "finished".into(), artifact_path: Some("/tmp/r2.root".into()) },
    ];
    drain_outputs(&mut jobbook, &stageout, before_kill).await;
    assert_eq!(dispatcher.range_updates.lock().len(), 2);

    esd_storage::jobbook_snapshot::write(dir.path(), &jobbook.snapshot()).unwrap();
    drop(jobbook);

    let manager = Arc::new(FakeHpcManager::new(FreeResources { nodes: 1, cores: 4, walltime_s: 100, events_capacity: 100 }));
    let (mut recovered, _supervisor) = recover(dir.path(), manager).await.unwrap();
    assert_eq!(recovered.ranges_for_job(&job_id).len(), 4);
    assert_eq!(
        recovered.ranges_for_job(&job_id).iter().filter(|r| r.status == RangeStatus::Reported).count(),
        2
    );

    let after_recovery = vec![
        HpcOutput { range_id: "rng-0003".into(), status: "finished".into(), artifact_path: Some("/tmp/r3.root".into()) },
        HpcOutput { range_id: "rng-0004".into(), status: "failed".into(), artifact_path: None },
    ];
    drain_outputs(&mut recovered, &stageout, after_recovery).await;

    assert_eq!(dispatcher.range_updates.lock().len(), 4);
    assert!(recovered.ranges_for_job(&job_id).iter().all(|r| r.status == RangeStatus::Reported));
}

/// Scenario 6 (spec.md §8): a job claims 100 ranges but the payload
/// never reports an outcome for any of them. The unresolved-range sweep
/// reports them all failed with no upload, and finalize marks the job
/// `failed`/`OverSubscribedEvents` rather than hanging forever.
#[tokio::test]
async fn scenario_6_oversubscribed_job_finalizes_failed_with_no_uploads() {
    let dispatcher = Arc::new(FakeDispatcher::default());
    let site_info = Arc::new(FakeSiteInfo::new(""));
    let object_store = Arc::new(FakeObjectStore::default());
    let mover = Arc::new(FakeMover::default());
    let stageout =
        StageoutPipeline::new(object_store.clone(), site_info.clone(), dispatcher.clone(), StageoutMode::PerEvent, false, 4);
    let lifecycle = Lifecycle::new(mover, site_info);

    let job = JobBuilder::default().state(JobState::Running).build();
    let job_id = job.id;
    let mut jobbook = JobBook::new();
    jobbook.add_job(job);
    let ranges: Vec<EventRange> = (1..=100u64).map(|n| assigned_range(job_id, n, n - 1, n - 1)).collect();
    jobbook.add_ranges(job_id, ranges).unwrap();

    sweep_unresolved_ranges(&stageout, &mut jobbook, &job_id).await;

    assert_eq!(object_store.uploads.lock().len(), 0);
    assert!(jobbook.ranges_for_job(&job_id).iter().all(|r| r.status == RangeStatus::Reported));
    assert_eq!(dispatcher.range_updates.lock().len(), 100);

    finalize_job(&lifecycle, &mut jobbook, &job_id);

    let job = jobbook.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error_code, Some(DriverError::OverSubscribedEvents { job_id: job_id.to_string() }.code()));
    assert_eq!(job.n_events_written, 0);
}
