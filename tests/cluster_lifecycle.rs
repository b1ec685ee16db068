// tests/cluster_lifecycle.rs

//! Cluster lifecycle tests against the fake batch scheduler: sizing,
//! address resolution, provisioning failure, teardown guarantees.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pipedag::cluster::{
    BatchDriverRunner, ClusterAllocation, ClusterLifecycle, ClusterRequest, ClusterState,
    DriverHandle, DriverRunner, DriverSpec, DriverStatus, DEFAULT_CONTROL_PORT,
};
use pipedag::compute::PollSettings;
use pipedag::errors::{PipedagError, Result};
use pipedag::exec::JobStatus;

use pipedag_test_utils::fake_scheduler::{info, FakeScheduler};
use pipedag_test_utils::init_tracing;

fn request(workers: u32, node_slots: u32) -> ClusterRequest {
    ClusterRequest {
        name: "stitch".to_string(),
        program: "start-cluster-node".to_string(),
        args: vec![],
        workers,
        node_slots,
        memory_per_node_gb: 128,
        min_workers: 1,
        account: Some("imaging".to_string()),
        control_port: DEFAULT_CONTROL_PORT,
        working_dir: std::env::temp_dir().join("pipedag-cluster-tests"),
    }
}

fn poll() -> PollSettings {
    PollSettings::from_millis(50, 5_000)
}

/// Fake driver runner whose handle reports a scripted terminal status.
#[derive(Debug)]
struct FakeDriverRunner {
    status: DriverStatus,
    errors: String,
    submissions: AtomicUsize,
}

impl FakeDriverRunner {
    fn succeeding() -> Self {
        Self {
            status: DriverStatus::Succeeded,
            errors: String::new(),
            submissions: AtomicUsize::new(0),
        }
    }

    fn failing(errors: &str) -> Self {
        Self {
            status: DriverStatus::Failed,
            errors: errors.to_string(),
            submissions: AtomicUsize::new(0),
        }
    }

    fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct FakeDriverHandle {
    status: DriverStatus,
    errors: String,
    address: String,
    killed: AtomicBool,
}

impl DriverHandle for FakeDriverHandle {
    fn app_id(&self) -> String {
        format!("fake-app@{}", self.address)
    }

    fn is_done(&self) -> bool {
        true
    }

    fn status(&self) -> DriverStatus {
        self.status
    }

    fn errors(&self) -> String {
        self.errors.clone()
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}

impl DriverRunner for FakeDriverRunner {
    fn submit(&self, spec: DriverSpec) -> Result<Arc<dyn DriverHandle>> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        assert!(
            !spec.control_address.is_empty(),
            "driver submitted without a resolved control address"
        );
        Ok(Arc::new(FakeDriverHandle {
            status: self.status,
            errors: self.errors.clone(),
            address: spec.control_address,
            killed: AtomicBool::new(false),
        }))
    }
}

fn driver_spec() -> DriverSpec {
    DriverSpec {
        name: "stitch-app".to_string(),
        control_address: String::new(),
        resource_path: Some(PathBuf::from("/apps/stitch.jar")),
        entry_point: "run-stitch".to_string(),
        args: vec!["--level".to_string(), "2".to_string()],
        output_dir: std::env::temp_dir().join("pipedag-driver-out"),
        error_dir: std::env::temp_dir().join("pipedag-driver-err"),
        sizing: BTreeMap::new(),
        cores: 4,
        account: Some("imaging".to_string()),
        timeout: Some(Duration::from_secs(3_600)),
    }
}

#[tokio::test(start_paused = true)]
async fn provision_sizes_request_and_resolves_address() {
    init_tracing();

    let scheduler = Arc::new(FakeScheduler::new());
    scheduler.plan_job(vec![
        None,
        Some(info(JobStatus::Pending, &[], None)),
        Some(info(JobStatus::Running, &["3*host07.cluster"], None)),
    ]);

    let lifecycle = ClusterLifecycle::new(scheduler.clone(), poll());
    let allocation = lifecycle
        .provision(request(2, 16))
        .await_result()
        .await
        .unwrap();

    assert_eq!(allocation.state, ClusterState::Addressable);
    assert_eq!(
        allocation.control_address.as_deref(),
        Some("host07.cluster:7077")
    );

    // numNodes=2 workers with nodeSlots=16 books 16 + 16*2 = 48 slots.
    let specs = scheduler.submitted_specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].slots, 48);
    assert_eq!(specs[0].account.as_deref(), Some("imaging"));
}

#[tokio::test(start_paused = true)]
async fn allocation_dying_before_running_fails_and_submits_no_driver() {
    init_tracing();

    let scheduler = Arc::new(FakeScheduler::new());
    scheduler.plan_dead_on_arrival();

    let lifecycle = ClusterLifecycle::new(scheduler.clone(), poll());
    let driver_runner = Arc::new(FakeDriverRunner::succeeding());

    let out = lifecycle
        .run(request(2, 16), driver_spec(), driver_runner.clone())
        .await_result()
        .await;

    assert!(matches!(out, Err(PipedagError::Provisioning(_))));
    assert_eq!(driver_runner.submission_count(), 0);

    // Failure-path cleanup still killed the allocation job.
    assert!(scheduler.kill_count(1) >= 1);
}

#[tokio::test(start_paused = true)]
async fn provisioning_timeout_still_tears_down() {
    init_tracing();

    let scheduler = Arc::new(FakeScheduler::new());
    // Stays pending forever.
    scheduler.plan_job(vec![Some(info(JobStatus::Pending, &[], None))]);

    let lifecycle = ClusterLifecycle::new(
        scheduler.clone(),
        PollSettings::from_millis(50, 500),
    );
    let driver_runner = Arc::new(FakeDriverRunner::succeeding());

    let out = lifecycle
        .run(request(1, 8), driver_spec(), driver_runner.clone())
        .await_result()
        .await;

    assert!(matches!(out, Err(PipedagError::Timeout { .. })));
    assert_eq!(driver_runner.submission_count(), 0);
    assert!(scheduler.kill_count(1) >= 1);
}

#[tokio::test(start_paused = true)]
async fn full_run_tears_down_after_driver_success() {
    init_tracing();

    let scheduler = Arc::new(FakeScheduler::new());
    scheduler.plan_running("16*node01");

    let lifecycle = ClusterLifecycle::new(scheduler.clone(), poll());
    let driver_runner = Arc::new(FakeDriverRunner::succeeding());

    let outcome = lifecycle
        .run(request(2, 16), driver_spec(), driver_runner.clone())
        .await_result()
        .await
        .unwrap();

    assert_eq!(outcome.status, DriverStatus::Succeeded);
    assert_eq!(driver_runner.submission_count(), 1);
    assert!(scheduler.kill_count(1) >= 1);
}

#[tokio::test(start_paused = true)]
async fn failed_driver_surfaces_errors_and_tears_down() {
    init_tracing();

    let scheduler = Arc::new(FakeScheduler::new());
    scheduler.plan_running("node02");

    let lifecycle = ClusterLifecycle::new(scheduler.clone(), poll());
    let driver_runner = Arc::new(FakeDriverRunner::failing("stage 3 lost all executors"));

    let out = lifecycle
        .run(request(1, 16), driver_spec(), driver_runner)
        .await_result()
        .await;

    match out {
        Err(PipedagError::ProcessFailed { diagnostic, .. }) => {
            assert!(diagnostic.contains("lost all executors"));
        }
        other => panic!("expected driver failure, got {other:?}"),
    }
    assert!(scheduler.kill_count(1) >= 1);
}

#[tokio::test(start_paused = true)]
async fn batch_driver_encodes_native_resource_spec() {
    init_tracing();

    let scheduler = Arc::new(FakeScheduler::new());
    scheduler.plan_job(vec![
        Some(info(JobStatus::Running, &["node01"], None)),
        Some(info(JobStatus::Done, &["node01"], Some(0))),
    ]);

    let runner = BatchDriverRunner::new(scheduler.clone());
    let handle = runner.submit(driver_spec()).unwrap();

    while !handle.is_done() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.status(), DriverStatus::Succeeded);
    assert!(handle.app_id().starts_with("job-"));

    let specs = scheduler.submitted_specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].name, "stitch-app-driver");
    // Cores, billing account, and wall-time (3600s -> 60 minutes) all
    // encoded in the scheduler-native spec.
    let native: Vec<&str> = specs[0].native_spec.iter().map(|s| s.as_str()).collect();
    assert_eq!(native, vec!["-n", "4", "-P", "imaging", "-W", "60"]);

    handle.kill();
    assert!(scheduler.kill_count(1) >= 1);
}

#[tokio::test(start_paused = true)]
async fn teardown_is_idempotent_and_tolerates_kill_failures() {
    init_tracing();

    let scheduler = Arc::new(FakeScheduler::new());
    // Seed three jobs so the ids exist in the fake's table.
    for _ in 0..3 {
        scheduler.plan_running("nodeXX");
    }
    let lifecycle = ClusterLifecycle::new(scheduler.clone(), poll());

    let control = lifecycle.submit_allocation(&request(0, 4)).unwrap().control_job;
    let w1 = lifecycle.submit_allocation(&request(0, 4)).unwrap().control_job;
    let w2 = lifecycle.submit_allocation(&request(0, 4)).unwrap().control_job;

    let allocation = ClusterAllocation {
        state: ClusterState::Addressable,
        control_job: control,
        worker_jobs: vec![w1, w2],
        control_address: Some("nodeXX:7077".to_string()),
        min_workers: 1,
        node_slots: 4,
        memory_per_node_gb: 32,
    };

    // One already-dead worker must not prevent killing the others.
    scheduler.fail_kills_for(w1);

    let down = lifecycle.teardown(&allocation);
    assert_eq!(down.state, ClusterState::TornDown);
    // Once from normal completion, once from an exception handler.
    lifecycle.teardown(&allocation);

    for id in [control, w1, w2] {
        assert!(scheduler.kill_count(id) >= 1, "job {id} never killed");
    }
}
