// src/exec/scheduler.rs

//! Batch-scheduler collaborator seam.
//!
//! The shared HPC scheduler accepts sized job submissions and reports job
//! state; this module defines the contract the engine requires from it.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::Result;
use crate::step::StepScript;
use crate::task::ResourceRequest;

/// Scheduler-assigned job identity.
pub type JobId = u64;

/// Observed state of a scheduler job.
///
/// "Not found yet" is represented by [`BatchScheduler::job_info`] returning
/// `None`: a freshly accepted submission may not appear in the job table
/// for a while.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Accepted but not yet dispatched to a host.
    Pending,
    Running,
    /// Terminated with a zero exit status.
    Done,
    /// Terminated with a non-zero exit status or was killed.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// One job submission.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    /// Processing slots to book for this job.
    pub slots: u32,
    pub memory_gb: u32,
    /// Hard wall-time limit, if any.
    pub wall_time: Option<Duration>,
    /// Billing/account tag, if the site requires one.
    pub account: Option<String>,
    /// Scheduler-native resource directives, passed through verbatim.
    pub native_spec: Vec<String>,
}

impl JobSpec {
    /// Build a job submission from a rendered step script and the task's
    /// resource request.
    pub fn from_script(name: impl Into<String>, script: StepScript, resources: &ResourceRequest) -> Self {
        Self {
            name: name.into(),
            program: script.program,
            args: script.args,
            env: script.env,
            working_dir: script.working_dir,
            stdout_path: script.stdout_path,
            stderr_path: script.stderr_path,
            slots: resources.slots,
            memory_gb: resources.memory_gb,
            wall_time: resources.timeout,
            account: None,
            native_spec: Vec::new(),
        }
    }

}

/// What the scheduler reports about a known job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub status: JobStatus,
    /// Executable hosts the job was dispatched to, in scheduler syntax
    /// (possibly with a core-count prefix like `"16*host03"`). Empty while
    /// the job has not been dispatched.
    pub exec_hosts: Vec<String>,
    pub exit_code: Option<i32>,
    /// Free-form resource-usage report, if the scheduler provides one.
    pub resource_usage: Option<String>,
}

/// The external HPC job-queueing system.
///
/// Implementations stay synchronous; all waiting happens through the
/// poll-until-ready primitive, which re-reads the job table on every
/// sample.
pub trait BatchScheduler: Send + Sync + Debug {
    /// Submit a job; returns the scheduler-assigned identity.
    fn submit_job(&self, spec: JobSpec) -> Result<JobId>;

    /// Current job info, or `None` if the job is not in the table yet.
    fn job_info(&self, id: JobId) -> Result<Option<JobInfo>>;

    /// Request termination of a job. Killing an already-dead job is an
    /// error the caller is expected to tolerate.
    fn kill_job(&self, id: JobId) -> Result<()>;
}
