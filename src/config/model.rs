// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::compute::PollSettings;
use crate::types::CanceledDependencyPolicy;

/// Top-level configuration as read from a TOML file, before semantic
/// validation.
///
/// ```toml
/// [engine]
/// poll_interval_ms = 500
///
/// [task.convert]
/// program = "tiff2zarr"
/// args = ["in.tif", "out.zarr"]
/// outputs = ["*.zarr"]
///
/// [task.stitch]
/// program = "stitch"
/// args = ["out.zarr"]
/// after = ["convert"]
/// outputs = ["stitched/*.zarr"]
/// on_cluster = true
/// ```
///
/// All sections are optional and have reasonable defaults, except that at
/// least one `[task.<name>]` must be present.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    /// Engine behaviour from `[engine]`.
    #[serde(default)]
    pub engine: EngineSection,

    /// Cluster geometry from `[cluster]`.
    #[serde(default)]
    pub cluster: ClusterSection,

    /// Per-task resource defaults from `[default]`.
    #[serde(default)]
    pub default: DefaultSection,

    /// All tasks from `[task.<name>]`, keyed by task name.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

/// Validated configuration. Constructed via
/// `ConfigFile::try_from(RawConfigFile)` in `config::validate`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineSection,
    pub cluster: ClusterSection,
    pub default: DefaultSection,
    pub task: BTreeMap<String, TaskConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        engine: EngineSection,
        cluster: ClusterSection,
        default: DefaultSection,
        task: BTreeMap<String, TaskConfig>,
    ) -> Self {
        Self {
            engine,
            cluster,
            default,
            task,
        }
    }

    /// Poll settings shared by every suspend operation the run performs.
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings::from_millis(self.engine.poll_interval_ms, self.engine.poll_timeout_ms)
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Delay between readiness samples, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Total budget for any single suspend operation, in milliseconds.
    /// Zero means no timeout.
    #[serde(default)]
    pub poll_timeout_ms: u64,

    /// How a canceled dependency propagates: `"success"` or `"failure"`.
    #[serde(default)]
    pub canceled_dependency_policy: CanceledDependencyPolicy,

    /// Owner recorded on submitted task records.
    #[serde(default = "default_owner")]
    pub owner: String,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_owner() -> String {
    "pipeline".to_string()
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: 0,
            canceled_dependency_policy: CanceledDependencyPolicy::default(),
            owner: default_owner(),
        }
    }
}

/// `[cluster]` section: geometry for tasks with `on_cluster = true`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSection {
    /// Command that boots a cluster node.
    #[serde(default = "default_node_program")]
    pub node_program: String,

    #[serde(default)]
    pub node_args: Vec<String>,

    /// Worker nodes per allocation, in addition to the control node.
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Processing slots per node.
    #[serde(default = "default_node_slots")]
    pub node_slots: u32,

    #[serde(default = "default_memory_per_node_gb")]
    pub memory_per_node_gb: u32,

    /// Minimum workers before the cluster counts as usable.
    #[serde(default = "default_min_workers")]
    pub min_workers: u32,

    /// Port of the cluster's control endpoint.
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Billing/account tag passed to the scheduler, if the site needs one.
    #[serde(default)]
    pub billing_account: Option<String>,
}

fn default_node_program() -> String {
    "start-cluster-node".to_string()
}

fn default_workers() -> u32 {
    2
}

fn default_node_slots() -> u32 {
    16
}

fn default_memory_per_node_gb() -> u32 {
    128
}

fn default_min_workers() -> u32 {
    1
}

fn default_control_port() -> u16 {
    crate::cluster::DEFAULT_CONTROL_PORT
}

impl ClusterSection {
    /// Cluster geometry for the cluster-backed step runner.
    pub fn geometry(&self) -> crate::cluster::ClusterGeometry {
        crate::cluster::ClusterGeometry {
            node_program: self.node_program.clone(),
            node_args: self.node_args.clone(),
            workers: self.workers,
            node_slots: self.node_slots,
            memory_per_node_gb: self.memory_per_node_gb,
            min_workers: self.min_workers,
            control_port: self.control_port,
            account: self.billing_account.clone(),
        }
    }
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            node_program: default_node_program(),
            node_args: Vec::new(),
            workers: default_workers(),
            node_slots: default_node_slots(),
            memory_per_node_gb: default_memory_per_node_gb(),
            min_workers: default_min_workers(),
            control_port: default_control_port(),
            billing_account: None,
        }
    }
}

/// `[default]` section: per-task resource defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DefaultSection {
    /// Default processing slots for tasks that do not override them.
    #[serde(default)]
    pub slots: Option<u32>,

    /// Default memory request in gigabytes.
    #[serde(default)]
    pub memory_gb: Option<u32>,

    /// Default hard wall-time in seconds; absent means unbounded.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// The external program to execute.
    pub program: String,

    /// Canonical argument list; also the task's equivalence key.
    #[serde(default)]
    pub args: Vec<String>,

    /// Dependency list: this task waits for all tasks listed here.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub slots: Option<u32>,

    #[serde(default)]
    pub memory_gb: Option<u32>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Working directory; defaults to `runs/<name>/work`.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Results directory; defaults to `runs/<name>/results`.
    #[serde(default)]
    pub results_dir: Option<PathBuf>,

    /// Scratch directory for large transient outputs, distinct from the
    /// network-visible working directory.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Declared output artifact patterns, relative to the results dir.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Extra environment entries for the step process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Per-instance configuration records for array-style invocations,
    /// materialized next to the script before execution.
    #[serde(default)]
    pub instances: Vec<String>,

    /// Run this task as a driver application on a provisioned cluster.
    #[serde(default)]
    pub on_cluster: bool,
}

impl TaskConfig {
    pub fn effective_slots(&self, defaults: &DefaultSection) -> u32 {
        self.slots.or(defaults.slots).unwrap_or(1)
    }

    pub fn effective_memory_gb(&self, defaults: &DefaultSection) -> u32 {
        self.memory_gb.or(defaults.memory_gb).unwrap_or(1)
    }

    pub fn effective_timeout(&self, defaults: &DefaultSection) -> Option<Duration> {
        self.timeout_secs
            .or(defaults.timeout_secs)
            .map(Duration::from_secs)
    }
}
