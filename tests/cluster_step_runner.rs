// tests/cluster_step_runner.rs

//! A cluster-backed task flowing through the service engine: the step is
//! rendered as usual, the runner provisions an allocation, runs the script
//! as the driver application, and tears the allocation down.

use std::sync::Arc;

use pipedag::cluster::{ClusterLifecycle, ClusterStepRunner, DriverRunner, DriverSpec};
use pipedag::compute::PollSettings;
use pipedag::config::ClusterSection;
use pipedag::engine::{EngineSettings, ServiceEngine};
use pipedag::errors::Result;
use pipedag::step::{PatternClassifier, Step};
use pipedag::task::{InMemoryTaskStore, TaskService, TaskState, TaskStore};
use pipedag::types::CanceledDependencyPolicy;

use pipedag_test_utils::builders::{FakeStep, TaskRecordBuilder};
use pipedag_test_utils::fake_runner::FakeProcessRunner;
use pipedag_test_utils::fake_scheduler::FakeScheduler;
use pipedag_test_utils::init_tracing;

/// Driver runner that records the submitted spec and reports immediate
/// success.
#[derive(Debug, Default)]
struct RecordingDriverRunner {
    specs: std::sync::Mutex<Vec<DriverSpec>>,
}

#[derive(Debug)]
struct DoneHandle;

impl pipedag::cluster::DriverHandle for DoneHandle {
    fn app_id(&self) -> String {
        "app-1".to_string()
    }
    fn is_done(&self) -> bool {
        true
    }
    fn status(&self) -> pipedag::cluster::DriverStatus {
        pipedag::cluster::DriverStatus::Succeeded
    }
    fn errors(&self) -> String {
        String::new()
    }
    fn kill(&self) {}
}

impl DriverRunner for RecordingDriverRunner {
    fn submit(&self, spec: DriverSpec) -> Result<Arc<dyn pipedag::cluster::DriverHandle>> {
        self.specs.lock().unwrap().push(spec);
        Ok(Arc::new(DoneHandle))
    }
}

#[tokio::test(start_paused = true)]
async fn cluster_task_runs_as_driver_and_tears_down() {
    init_tracing();

    let scheduler = Arc::new(FakeScheduler::new());
    scheduler.plan_running("8*gpu-node02");

    let poll = PollSettings::from_millis(50, 10_000);
    let lifecycle = ClusterLifecycle::new(scheduler.clone(), poll);
    let driver_runner = Arc::new(RecordingDriverRunner::default());

    // Geometry straight from the config section defaults.
    let geometry = ClusterSection::default().geometry();
    let cluster_runner = Arc::new(ClusterStepRunner::new(
        lifecycle,
        driver_runner.clone(),
        geometry,
    ));

    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let service = TaskService::new(Arc::clone(&store), CanceledDependencyPolicy::Failure);
    let engine = ServiceEngine::new(
        service,
        Arc::new(FakeProcessRunner::new()),
        Arc::new(PatternClassifier::standard()),
        EngineSettings { poll },
    );

    let record = TaskRecordBuilder::new("stitch")
        .args(&["--level", "2"])
        .slots(8)
        .build();
    let step: Arc<dyn Step> = Arc::new(FakeStep::new());

    let done = engine
        .submit_with_runner(record, step, cluster_runner)
        .await_result()
        .await
        .unwrap();

    assert_eq!(done.state, TaskState::Successful);

    // The allocation was submitted (sized from the default geometry:
    // 16 slots on 1 + 2 nodes) and later torn down.
    let specs = scheduler.submitted_specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].slots, 48);
    assert!(scheduler.kill_count(1) >= 1);

    // The driver saw the rendered script and the resolved address.
    let driver_specs = driver_runner.specs.lock().unwrap();
    assert_eq!(driver_specs.len(), 1);
    assert_eq!(driver_specs[0].entry_point, "stitch");
    assert_eq!(driver_specs[0].control_address, "gpu-node02:7077");
    assert_eq!(driver_specs[0].cores, 8);
}
