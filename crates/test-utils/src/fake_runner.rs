use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use pipedag::errors::Result;
use pipedag::exec::{ProcessOutcome, ProcessRunner};
use pipedag::step::StepScript;
use pipedag::task::ResourceRequest;

/// A fake process runner that:
/// - records which tasks were dispatched (and how often)
/// - returns a scripted [`ProcessOutcome`] per task name, defaulting to a
///   clean success.
///
/// Tests that assert "the external process was never re-invoked" read the
/// per-task run counts.
#[derive(Debug, Default)]
pub struct FakeProcessRunner {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    outcomes: HashMap<String, ProcessOutcome>,
    dispatched: Vec<(String, StepScript)>,
}

impl FakeProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome for a given task name.
    pub fn plan_outcome(&self, task: &str, outcome: ProcessOutcome) {
        self.inner
            .lock()
            .unwrap()
            .outcomes
            .insert(task.to_string(), outcome);
    }

    /// Script a failing process for a given task name.
    pub fn plan_failure(&self, task: &str, exit_code: i32, stderr: &str) {
        self.plan_outcome(
            task,
            ProcessOutcome {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        );
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .dispatched
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn run_count(&self, task: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .dispatched
            .iter()
            .filter(|(name, _)| name == task)
            .count()
    }

    pub fn last_script(&self, task: &str) -> Option<StepScript> {
        self.inner
            .lock()
            .unwrap()
            .dispatched
            .iter()
            .rev()
            .find(|(name, _)| name == task)
            .map(|(_, script)| script.clone())
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn run(
        &self,
        task_name: String,
        script: StepScript,
        _resources: ResourceRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessOutcome>> + Send + '_>> {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            inner.dispatched.push((task_name.clone(), script));
            inner
                .outcomes
                .get(&task_name)
                .cloned()
                .unwrap_or(ProcessOutcome {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
        };

        Box::pin(async move { Ok(outcome) })
    }
}
