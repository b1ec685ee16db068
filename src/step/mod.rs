// src/step/mod.rs

//! The uniform contract for wrapping an arbitrary external executable as a
//! task.
//!
//! - the [`Step`] capability: prepare / environment / render /
//!   check-ready / collect-result
//! - the separate [`ErrorClassifier`](classify::ErrorClassifier)
//!   capability in [`classify`]
//! - [`command_step`]: the generic [`CommandStep`](command_step::CommandStep)
//!   wrapper for external tools
//!
//! The two capabilities are combined via composition; there is no
//! processor inheritance chain.

pub mod classify;
pub mod command_step;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use tracing::debug;

use crate::errors::Result;
use crate::task::TaskRecord;

pub use classify::{ErrorClassifier, OutputScan, PatternClassifier};
pub use command_step::CommandStep;

/// Directory contract for one external step.
///
/// `scratch_dir`, when present, is distinct from the network-visible
/// working directory and holds large transient outputs until they are
/// moved to `results_dir`.
#[derive(Debug, Clone)]
pub struct StepDirs {
    pub working_dir: PathBuf,
    pub results_dir: PathBuf,
    pub scratch_dir: Option<PathBuf>,
}

impl StepDirs {
    pub fn new(working_dir: PathBuf, results_dir: PathBuf, scratch_dir: Option<PathBuf>) -> Self {
        Self {
            working_dir,
            results_dir,
            scratch_dir,
        }
    }

    /// Create all declared directories.
    pub fn create_all(&self) -> Result<()> {
        fs::create_dir_all(&self.working_dir)
            .with_context(|| format!("creating working dir {:?}", self.working_dir))?;
        fs::create_dir_all(&self.results_dir)
            .with_context(|| format!("creating results dir {:?}", self.results_dir))?;
        if let Some(scratch) = &self.scratch_dir {
            fs::create_dir_all(scratch)
                .with_context(|| format!("creating scratch dir {:?}", scratch))?;
        }
        Ok(())
    }

    /// Move everything from the scratch directory into the results
    /// directory. Each entry is moved with a rename, so an artifact is
    /// either fully absent or fully present in `results_dir`.
    pub fn promote_scratch(&self) -> Result<()> {
        let Some(scratch) = &self.scratch_dir else {
            return Ok(());
        };
        if !scratch.is_dir() {
            return Ok(());
        }

        for entry in fs::read_dir(scratch).with_context(|| format!("reading {scratch:?}"))? {
            let entry = entry.map_err(anyhow::Error::from)?;
            let target = self.results_dir.join(entry.file_name());
            debug!(from = ?entry.path(), to = ?target, "promoting scratch artifact");
            fs::rename(entry.path(), &target)
                .with_context(|| format!("promoting {:?} to {:?}", entry.path(), target))?;
        }
        Ok(())
    }

    /// Remove the scratch directory and anything left in it.
    pub fn remove_scratch(&self) -> Result<()> {
        if let Some(scratch) = &self.scratch_dir {
            if scratch.is_dir() {
                fs::remove_dir_all(scratch)
                    .with_context(|| format!("removing scratch dir {scratch:?}"))?;
            }
        }
        Ok(())
    }
}

/// A rendered invocation, ready to hand to a process runner.
///
/// `config_records` are per-instance configuration lines for array-style
/// invocations; the runner materializes them next to the script before
/// execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepScript {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub config_records: Vec<String>,
}

/// Capability contract for a task that wraps an external executable.
///
/// `check_ready` and `collect_result` may be called many times, including
/// before the process has ever started; both must be side-effect-free and
/// report "not ready" rather than erroring on absent outputs.
pub trait Step: Send + Sync + Debug {
    /// Validate arguments and create required output directories. Fails
    /// fast with a descriptive error when preconditions are unmet; no
    /// external work may have been submitted by then.
    fn prepare(&self, task: &TaskRecord) -> Result<()>;

    /// Process environment for the step: library search paths plus
    /// resource-limit hints derived from the requested processing slots.
    fn environment(&self, task: &TaskRecord) -> BTreeMap<String, String>;

    /// Produce the invocation deterministically from the task's arguments.
    fn render(&self, task: &TaskRecord) -> Result<StepScript>;

    /// One-time hook after successful execution, before readiness polling
    /// (e.g. promoting scratch artifacts). Default: nothing.
    fn finalize(&self, _task: &TaskRecord) -> Result<()> {
        Ok(())
    }

    /// Readiness probe over the declared output artifacts. Never re-invokes
    /// external work.
    fn check_ready(&self, task: &TaskRecord) -> Result<bool>;

    /// Map the declared artifacts to the task's serialized result payload.
    fn collect_result(&self, task: &TaskRecord) -> Result<serde_json::Value>;

    /// Cleanup hook run after the task's chain ends, on every outcome
    /// (e.g. removing transient scratch space). Default: nothing.
    fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}
