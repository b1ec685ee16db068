#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use pipedag::config::{ConfigFile, RawConfigFile, TaskConfig};
use pipedag::errors::{PipedagError, Result};
use pipedag::step::{Step, StepScript};
use pipedag::task::{ResourceRequest, TaskId, TaskRecord};

/// Builder for `TaskRecord` to simplify test setup.
pub struct TaskRecordBuilder {
    record: TaskRecord,
}

impl TaskRecordBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            record: TaskRecord::new(name, "test-owner", vec![name.to_string()]),
        }
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.record.owner = owner.to_string();
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.record.args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.record.dependencies.push(id);
        self
    }

    pub fn slots(mut self, slots: u32) -> Self {
        self.record.resources.slots = slots;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.record.resources.timeout = Some(timeout);
        self
    }

    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.record.resources = resources;
        self
    }

    pub fn build(self) -> TaskRecord {
        self.record
    }
}

/// An in-memory [`Step`] that never touches the filesystem.
///
/// - `check_ready` reports a flag that starts false (unless
///   [`ready_at_submission`](Self::ready_at_submission) is set) and flips
///   to true in `finalize`, mimicking outputs landing after a successful
///   process.
/// - cleanup invocations are counted, for cleanup-hook assertions.
#[derive(Debug, Default)]
pub struct FakeStep {
    ready: AtomicBool,
    prepare_error: Option<String>,
    cleanups: AtomicUsize,
}

impl FakeStep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outputs already exist when the task is submitted.
    pub fn ready_at_submission(self) -> Self {
        self.ready.store(true, Ordering::SeqCst);
        self
    }

    /// Make `prepare` fail validation with the given message.
    pub fn failing_prepare(mut self, message: &str) -> Self {
        self.prepare_error = Some(message.to_string());
        self
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl Step for FakeStep {
    fn prepare(&self, task: &TaskRecord) -> Result<()> {
        match &self.prepare_error {
            Some(message) => Err(PipedagError::Validation(format!(
                "task '{}': {message}",
                task.name
            ))),
            None => Ok(()),
        }
    }

    fn environment(&self, task: &TaskRecord) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "OMP_NUM_THREADS".to_string(),
            task.resources.slots.to_string(),
        );
        env
    }

    fn render(&self, task: &TaskRecord) -> Result<StepScript> {
        Ok(StepScript {
            program: task.name.clone(),
            args: task.args.clone(),
            env: self.environment(task),
            working_dir: std::env::temp_dir(),
            stdout_path: None,
            stderr_path: None,
            config_records: Vec::new(),
        })
    }

    fn finalize(&self, _task: &TaskRecord) -> Result<()> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn check_ready(&self, _task: &TaskRecord) -> Result<bool> {
        Ok(self.ready.load(Ordering::SeqCst))
    }

    fn collect_result(&self, task: &TaskRecord) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "task": task.name, "ok": true }))
    }

    fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                engine: Default::default(),
                cluster: Default::default(),
                default: Default::default(),
                task: BTreeMap::new(),
            },
        }
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.config.task.insert(name.to_string(), task);
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(program: &str) -> Self {
        Self {
            task: TaskConfig {
                program: program.to_string(),
                args: vec![],
                after: vec![],
                slots: None,
                memory_gb: None,
                timeout_secs: None,
                working_dir: None,
                results_dir: None,
                scratch_dir: None,
                outputs: vec!["*.out".to_string()],
                env: BTreeMap::new(),
                instances: vec![],
                on_cluster: false,
            },
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.task.args.push(arg.to_string());
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn output(mut self, pattern: &str) -> Self {
        self.task.outputs.push(pattern.to_string());
        self
    }

    pub fn slots(mut self, slots: u32) -> Self {
        self.task.slots = Some(slots);
        self
    }

    pub fn on_cluster(mut self, val: bool) -> Self {
        self.task.on_cluster = val;
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}
