// src/exec/runner.rs

//! Process runners: execute a rendered step script either in-process or
//! via the batch scheduler.

use std::fmt::Debug;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::compute::{Computation, PollSettings};
use crate::errors::{PipedagError, Result};
use crate::exec::scheduler::{BatchScheduler, JobSpec, JobStatus};
use crate::step::StepScript;
use crate::task::ResourceRequest;

/// Exit status and captured streams of one executed script.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Both streams joined, for the error classifier.
    pub fn combined_output(&self) -> String {
        let mut combined = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&self.stderr);
        }
        combined
    }
}

/// Trait abstracting how a rendered script is executed.
///
/// Production code uses [`LocalProcessRunner`] or
/// [`SchedulerProcessRunner`]; tests provide their own implementation that
/// doesn't spawn real processes.
pub trait ProcessRunner: Send + Sync + Debug {
    /// Execute `script` subject to the task's requested resources and
    /// timeout; returns exit status and captured streams.
    fn run(
        &self,
        task_name: String,
        script: StepScript,
        resources: ResourceRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessOutcome>> + Send + '_>>;
}

/// Write per-instance configuration records next to the script, one file
/// per instance, before execution.
fn materialize_config_records(script: &StepScript) -> Result<()> {
    for (index, record) in script.config_records.iter().enumerate() {
        let path = script.working_dir.join(format!("instance_{index}.cfg"));
        fs::write(&path, record)
            .with_context(|| format!("writing instance config {path:?}"))?;
    }
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating dir {parent:?}"))?;
    }
    Ok(())
}

/// Runs scripts directly on the submitting host.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessRunner;

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self
    }

    async fn run_inner(
        task_name: &str,
        script: StepScript,
        resources: ResourceRequest,
    ) -> Result<ProcessOutcome> {
        materialize_config_records(&script)?;

        info!(
            task = %task_name,
            program = %script.program,
            args = ?script.args,
            "starting step process"
        );

        let mut cmd = Command::new(&script.program);
        cmd.args(&script.args)
            .envs(&script.env)
            .current_dir(&script.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning process for task '{task_name}'"))?;

        let wait = child.wait_with_output();
        let output = match resources.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(res) => res,
                Err(_) => {
                    // kill_on_drop reaps the abandoned child.
                    warn!(task = %task_name, ?limit, "step process exceeded its timeout");
                    return Err(PipedagError::Timeout {
                        waiting_for: format!("process of task '{task_name}'"),
                        elapsed: limit,
                    });
                }
            },
            None => wait.await,
        }
        .with_context(|| format!("waiting for process of task '{task_name}'"))?;

        let outcome = ProcessOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        info!(
            task = %task_name,
            exit_code = outcome.exit_code,
            "step process exited"
        );

        // Mirror captured streams to the declared redirection paths.
        if let Some(path) = &script.stdout_path {
            ensure_parent_dir(path)?;
            fs::write(path, &outcome.stdout)
                .with_context(|| format!("writing stdout to {path:?}"))?;
        }
        if let Some(path) = &script.stderr_path {
            ensure_parent_dir(path)?;
            fs::write(path, &outcome.stderr)
                .with_context(|| format!("writing stderr to {path:?}"))?;
        }

        Ok(outcome)
    }
}

impl ProcessRunner for LocalProcessRunner {
    fn run(
        &self,
        task_name: String,
        script: StepScript,
        resources: ResourceRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessOutcome>> + Send + '_>> {
        Box::pin(async move { Self::run_inner(&task_name, script, resources).await })
    }
}

/// Submits scripts to the batch scheduler and polls their completion.
#[derive(Debug)]
pub struct SchedulerProcessRunner {
    scheduler: Arc<dyn BatchScheduler>,
    poll: PollSettings,
}

impl SchedulerProcessRunner {
    pub fn new(scheduler: Arc<dyn BatchScheduler>, poll: PollSettings) -> Self {
        Self { scheduler, poll }
    }
}

impl ProcessRunner for SchedulerProcessRunner {
    fn run(
        &self,
        task_name: String,
        script: StepScript,
        resources: ResourceRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessOutcome>> + Send + '_>> {
        let scheduler = Arc::clone(&self.scheduler);
        let poll = self.poll;

        Box::pin(async move {
            materialize_config_records(&script)?;

            let stdout_path = script.stdout_path.clone();
            let stderr_path = script.stderr_path.clone();

            let spec = JobSpec::from_script(task_name.clone(), script, &resources);
            let job_id = scheduler.submit_job(spec)?;
            info!(task = %task_name, job_id, "submitted step job to batch scheduler");

            let poll_scheduler = Arc::clone(&scheduler);
            let info = Computation::ready(job_id)
                .suspend_until(
                    format!("job {job_id} of task '{task_name}'"),
                    poll,
                    move |id| {
                        let scheduler = Arc::clone(&poll_scheduler);
                        async move {
                            // Re-read the job table every sample; a job that
                            // hasn't appeared yet is simply "no observation".
                            Ok(scheduler
                                .job_info(id)?
                                .filter(|info| info.status.is_terminal()))
                        }
                    },
                    |_| true,
                )
                .await_result()
                .await?;

            let exit_code = info.exit_code.unwrap_or(match info.status {
                JobStatus::Done => 0,
                _ => -1,
            });

            debug!(task = %task_name, job_id, exit_code, "batch job terminal");

            // Streams come back through the declared redirection files.
            let stdout = stdout_path
                .as_deref()
                .and_then(|p| fs::read_to_string(p).ok())
                .unwrap_or_default();
            let stderr = stderr_path
                .as_deref()
                .and_then(|p| fs::read_to_string(p).ok())
                .unwrap_or_default();

            Ok(ProcessOutcome {
                exit_code,
                stdout,
                stderr,
            })
        })
    }
}
