// src/cluster/driver.rs

//! Driver-application submission strategies.
//!
//! A driver application is one run of user compute logic against a running
//! cluster allocation. The two runner strategies accept identical inputs
//! and return the same handle shape, so callers never care whether the
//! driver runs in-process or as its own scheduler job.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::exec::{BatchScheduler, JobId, JobSpec, JobStatus};

/// Inputs for one driver run. Identical for both strategies.
#[derive(Debug, Clone)]
pub struct DriverSpec {
    pub name: String,
    /// Resolved control endpoint of the cluster the driver talks to.
    pub control_address: String,
    /// Location of the application resource (jar or script).
    pub resource_path: Option<PathBuf>,
    /// Program/entry point to invoke.
    pub entry_point: String,
    pub args: Vec<String>,
    pub output_dir: PathBuf,
    pub error_dir: PathBuf,
    /// Free-form sizing parameters, exported into the driver environment.
    pub sizing: BTreeMap<String, String>,
    pub cores: u32,
    pub account: Option<String>,
    /// Hard wall-time for the application, if any.
    pub timeout: Option<Duration>,
}

impl DriverSpec {
    fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.sizing.clone();
        env.insert(
            "PIPEDAG_CLUSTER_ADDRESS".to_string(),
            self.control_address.clone(),
        );
        if let Some(resource) = &self.resource_path {
            env.insert(
                "PIPEDAG_APP_RESOURCE".to_string(),
                resource.display().to_string(),
            );
        }
        env
    }
}

/// Terminal-or-not status of a driver application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Running,
    Succeeded,
    Failed,
}

/// Handle to a started driver application.
///
/// Owned by whichever runner started it; killed during cluster teardown if
/// still running.
pub trait DriverHandle: Send + Sync + Debug {
    /// Application identity assigned by the runner.
    fn app_id(&self) -> String;
    fn is_done(&self) -> bool;
    fn status(&self) -> DriverStatus;
    /// Captured error text, empty while none.
    fn errors(&self) -> String;
    /// Request termination. Killing an already-finished application is a
    /// no-op.
    fn kill(&self);
}

/// Strategy for starting a driver application.
pub trait DriverRunner: Send + Sync + Debug {
    fn submit(&self, spec: DriverSpec) -> Result<Arc<dyn DriverHandle>>;
}

// ---------------------------------------------------------------------------
// In-process strategy
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LocalDriverState {
    done: bool,
    status: DriverStatus,
    errors: String,
}

/// Runs the driver as a child process on the submitting host.
#[derive(Debug, Clone, Default)]
pub struct LocalDriverRunner;

impl LocalDriverRunner {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug)]
struct LocalDriverHandle {
    app_id: String,
    state: Arc<Mutex<LocalDriverState>>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl DriverHandle for LocalDriverHandle {
    fn app_id(&self) -> String {
        self.app_id.clone()
    }

    fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    fn status(&self) -> DriverStatus {
        self.state.lock().unwrap().status
    }

    fn errors(&self) -> String {
        self.state.lock().unwrap().errors.clone()
    }

    fn kill(&self) {
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            if cancel.send(()).is_err() {
                debug!(app = %self.app_id, "driver already finished while killing");
            }
        }
    }
}

impl DriverRunner for LocalDriverRunner {
    fn submit(&self, spec: DriverSpec) -> Result<Arc<dyn DriverHandle>> {
        fs::create_dir_all(&spec.output_dir)
            .with_context(|| format!("creating driver output dir {:?}", spec.output_dir))?;
        fs::create_dir_all(&spec.error_dir)
            .with_context(|| format!("creating driver error dir {:?}", spec.error_dir))?;

        let stdout_file = std::fs::File::create(spec.output_dir.join(format!("{}.out", spec.name)))
            .with_context(|| format!("creating driver stdout file for '{}'", spec.name))?;

        let mut cmd = Command::new(&spec.entry_point);
        cmd.args(&spec.args)
            .envs(spec.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning driver '{}'", spec.name))?;

        let app_id = format!("local-{}", child.id().unwrap_or_default());
        info!(app = %app_id, driver = %spec.name, address = %spec.control_address, "driver started in-process");

        let state = Arc::new(Mutex::new(LocalDriverState {
            done: false,
            status: DriverStatus::Running,
            errors: String::new(),
        }));

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        // Drain stderr concurrently so a chatty driver cannot fill the pipe
        // and block its own exit.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut text = String::new();
            if let Some(mut stream) = stderr {
                let _ = stream.read_to_string(&mut text).await;
            }
            text
        });

        let monitor_state = Arc::clone(&state);
        let monitor_id = app_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                outcome = child.wait() => {
                    let stderr_text = stderr_task.await.unwrap_or_default();

                    let mut state = monitor_state.lock().unwrap();
                    state.done = true;
                    match outcome {
                        Ok(status) if status.success() => {
                            state.status = DriverStatus::Succeeded;
                        }
                        Ok(status) => {
                            state.status = DriverStatus::Failed;
                            state.errors = if stderr_text.is_empty() {
                                format!("driver exited with {status}")
                            } else {
                                stderr_text
                            };
                        }
                        Err(err) => {
                            state.status = DriverStatus::Failed;
                            state.errors = format!("waiting for driver: {err}");
                        }
                    }
                }
                _ = &mut cancel_rx => {
                    info!(app = %monitor_id, "kill requested; terminating driver process");
                    if let Err(err) = child.kill().await {
                        warn!(app = %monitor_id, error = %err, "failed to kill driver process");
                    }
                    let mut state = monitor_state.lock().unwrap();
                    state.done = true;
                    state.status = DriverStatus::Failed;
                    state.errors = "killed during teardown".to_string();
                }
            }
        });

        Ok(Arc::new(LocalDriverHandle {
            app_id,
            state,
            cancel: Mutex::new(Some(cancel_tx)),
        }))
    }
}

// ---------------------------------------------------------------------------
// Batch-submitted strategy
// ---------------------------------------------------------------------------

/// Submits the driver as its own scheduler job, with a native resource
/// spec encoding requested cores, billing account, and a hard wall-time
/// derived from the application timeout.
#[derive(Debug)]
pub struct BatchDriverRunner {
    scheduler: Arc<dyn BatchScheduler>,
}

impl BatchDriverRunner {
    pub fn new(scheduler: Arc<dyn BatchScheduler>) -> Self {
        Self { scheduler }
    }
}

#[derive(Debug)]
struct BatchDriverHandle {
    job_id: JobId,
    stderr_path: PathBuf,
    scheduler: Arc<dyn BatchScheduler>,
}

impl BatchDriverHandle {
    fn info_status(&self) -> Option<JobStatus> {
        match self.scheduler.job_info(self.job_id) {
            Ok(info) => info.map(|i| i.status),
            Err(err) => {
                warn!(job_id = self.job_id, error = %err, "failed to read driver job info");
                None
            }
        }
    }
}

impl DriverHandle for BatchDriverHandle {
    fn app_id(&self) -> String {
        format!("job-{}", self.job_id)
    }

    fn is_done(&self) -> bool {
        self.info_status().is_some_and(|s| s.is_terminal())
    }

    fn status(&self) -> DriverStatus {
        match self.info_status() {
            Some(JobStatus::Done) => DriverStatus::Succeeded,
            Some(JobStatus::Failed) => DriverStatus::Failed,
            _ => DriverStatus::Running,
        }
    }

    fn errors(&self) -> String {
        fs::read_to_string(&self.stderr_path).unwrap_or_default()
    }

    fn kill(&self) {
        if let Err(err) = self.scheduler.kill_job(self.job_id) {
            debug!(job_id = self.job_id, error = %err, "driver kill failed (may already be dead)");
        }
    }
}

impl DriverRunner for BatchDriverRunner {
    fn submit(&self, spec: DriverSpec) -> Result<Arc<dyn DriverHandle>> {
        fs::create_dir_all(&spec.output_dir)
            .with_context(|| format!("creating driver output dir {:?}", spec.output_dir))?;
        fs::create_dir_all(&spec.error_dir)
            .with_context(|| format!("creating driver error dir {:?}", spec.error_dir))?;

        let stdout_path = spec.output_dir.join(format!("{}.out", spec.name));
        let stderr_path = spec.error_dir.join(format!("{}.err", spec.name));

        let mut native_spec = vec!["-n".to_string(), spec.cores.to_string()];
        if let Some(account) = &spec.account {
            native_spec.push("-P".to_string());
            native_spec.push(account.clone());
        }
        if let Some(timeout) = spec.timeout {
            // Wall-time in whole minutes, rounded up.
            let minutes = timeout.as_secs().div_ceil(60).max(1);
            native_spec.push("-W".to_string());
            native_spec.push(minutes.to_string());
        }

        let job = JobSpec {
            name: format!("{}-driver", spec.name),
            program: spec.entry_point.clone(),
            args: spec.args.clone(),
            env: spec.environment(),
            working_dir: spec.output_dir.clone(),
            stdout_path: Some(stdout_path),
            stderr_path: Some(stderr_path.clone()),
            slots: spec.cores,
            memory_gb: 0,
            wall_time: spec.timeout,
            account: spec.account.clone(),
            native_spec,
        };

        let job_id = self.scheduler.submit_job(job)?;
        info!(
            job_id,
            driver = %spec.name,
            address = %spec.control_address,
            "driver submitted as batch job"
        );

        Ok(Arc::new(BatchDriverHandle {
            job_id,
            stderr_path,
            scheduler: Arc::clone(&self.scheduler),
        }))
    }
}
