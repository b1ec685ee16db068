// tests/batch_runner.rs

//! SchedulerProcessRunner: submit a rendered script as a batch job, poll
//! its state, and read streams back from the redirection files.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use pipedag::compute::PollSettings;
use pipedag::errors::PipedagError;
use pipedag::exec::{JobStatus, ProcessRunner, SchedulerProcessRunner};
use pipedag::step::StepScript;
use pipedag::task::ResourceRequest;

use pipedag_test_utils::fake_scheduler::{info, FakeScheduler};
use pipedag_test_utils::init_tracing;
use tempfile::TempDir;

fn script_in(tmp: &TempDir) -> StepScript {
    StepScript {
        program: "deconvolve".to_string(),
        args: vec!["--iterations".to_string(), "10".to_string()],
        env: BTreeMap::new(),
        working_dir: tmp.path().to_path_buf(),
        stdout_path: Some(tmp.path().join("task.out")),
        stderr_path: Some(tmp.path().join("task.err")),
        config_records: vec!["tile=0".to_string(), "tile=1".to_string()],
    }
}

#[tokio::test(start_paused = true)]
async fn polls_job_to_completion_and_reads_streams() {
    init_tracing();

    let tmp = TempDir::new().unwrap();
    let scheduler = Arc::new(FakeScheduler::new());
    scheduler.plan_job(vec![
        None,
        Some(info(JobStatus::Pending, &[], None)),
        Some(info(JobStatus::Running, &["node04"], None)),
        Some(info(JobStatus::Done, &["node04"], Some(0))),
    ]);

    // Stream content the "job" wrote through its redirection files.
    fs::write(tmp.path().join("task.out"), "deconvolved 10 iterations\n").unwrap();
    fs::write(tmp.path().join("task.err"), "").unwrap();

    let runner = SchedulerProcessRunner::new(scheduler.clone(), PollSettings::from_millis(50, 5_000));
    let outcome = runner
        .run(
            "deconvolve".to_string(),
            script_in(&tmp),
            ResourceRequest::default(),
        )
        .await
        .unwrap();

    assert!(outcome.success());
    assert!(outcome.stdout.contains("deconvolved"));

    // Per-instance config records were materialized before submission.
    assert!(tmp.path().join("instance_0.cfg").is_file());
    assert!(tmp.path().join("instance_1.cfg").is_file());

    let specs = scheduler.submitted_specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].program, "deconvolve");
}

#[tokio::test(start_paused = true)]
async fn failed_job_reports_nonzero_exit() {
    init_tracing();

    let tmp = TempDir::new().unwrap();
    let scheduler = Arc::new(FakeScheduler::new());
    scheduler.plan_job(vec![
        Some(info(JobStatus::Running, &["node04"], None)),
        Some(info(JobStatus::Failed, &["node04"], Some(139))),
    ]);

    let runner = SchedulerProcessRunner::new(scheduler, PollSettings::from_millis(50, 5_000));
    let outcome = runner
        .run(
            "deconvolve".to_string(),
            script_in(&tmp),
            ResourceRequest::default(),
        )
        .await
        .unwrap();

    assert!(!outcome.success());
    assert_eq!(outcome.exit_code, 139);
}

#[tokio::test(start_paused = true)]
async fn job_never_appearing_times_out() {
    init_tracing();

    let tmp = TempDir::new().unwrap();
    let scheduler = Arc::new(FakeScheduler::new());
    scheduler.plan_job(vec![None]);

    let runner = SchedulerProcessRunner::new(scheduler, PollSettings::from_millis(50, 400));
    let out = runner
        .run(
            "deconvolve".to_string(),
            script_in(&tmp),
            ResourceRequest::default(),
        )
        .await;

    assert!(matches!(out, Err(PipedagError::Timeout { .. })));
}
