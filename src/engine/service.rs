// src/engine/service.rs

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::compute::{Computation, PollSettings};
use crate::errors::{PipedagError, Result};
use crate::exec::ProcessRunner;
use crate::step::{ErrorClassifier, Step};
use crate::task::{TaskEvent, TaskRecord, TaskService, TaskState};

/// Engine-wide knobs.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Poll settings for dependency readiness and output readiness.
    pub poll: PollSettings,
}

/// Drives submitted task records to a terminal state.
#[derive(Debug, Clone)]
pub struct ServiceEngine {
    service: TaskService,
    runner: Arc<dyn ProcessRunner>,
    classifier: Arc<dyn ErrorClassifier>,
    settings: EngineSettings,
}

impl ServiceEngine {
    pub fn new(
        service: TaskService,
        runner: Arc<dyn ProcessRunner>,
        classifier: Arc<dyn ErrorClassifier>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            service,
            runner,
            classifier,
            settings,
        }
    }

    pub fn task_service(&self) -> &TaskService {
        &self.service
    }

    /// Submit a task record with its step, using the engine's default
    /// runner.
    pub fn submit(&self, candidate: TaskRecord, step: Arc<dyn Step>) -> Computation<TaskRecord> {
        self.submit_with_runner(candidate, step, Arc::clone(&self.runner))
    }

    /// Submit a task record with its step and an explicit runner (e.g. a
    /// cluster-backed one).
    ///
    /// The returned computation resolves with the terminal record on
    /// success; failures carry the taxonomy error and leave the record in
    /// `Error` with a diagnostic event. Step cleanup runs on every
    /// outcome.
    pub fn submit_with_runner(
        &self,
        candidate: TaskRecord,
        step: Arc<dyn Step>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Computation<TaskRecord> {
        let engine = self.clone();
        let cleanup_step = Arc::clone(&step);
        let task_name = candidate.name.clone();

        Computation::supply(move || async move { engine.drive(candidate, step, runner).await })
            .on_complete(move |result| {
                if let Err(err) = cleanup_step.cleanup() {
                    warn!(task = %task_name, error = %err, "step cleanup failed");
                }
                match result {
                    Ok(record) => {
                        info!(task = %record.name, id = record.id, "task reached terminal success")
                    }
                    Err(err) => warn!(task = %task_name, error = %err, "task failed"),
                }
            })
    }

    async fn drive(
        &self,
        candidate: TaskRecord,
        step: Arc<dyn Step>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<TaskRecord> {
        // Idempotent submission: re-entrant callers converge on one record.
        let task = self.service.submit_dependency_if_not_found(candidate)?;
        let store = Arc::clone(self.service.store());

        if task.state.is_terminal() {
            return self.reconcile_terminal(task);
        }

        // Another submitter may already be driving this record; block on
        // its outcome instead of executing twice.
        if task.state != TaskState::Queued {
            debug!(task = %task.name, id = task.id, state = ?task.state, "record already in flight; waiting");
            return self.await_foreign_completion(task).await;
        }

        // 1. Validation: fail fast, no external work submitted.
        if let Err(err) = step.prepare(&task) {
            let _ = store.update_state(
                task.id,
                TaskState::Error,
                &format!("validation failed: {err}"),
            );
            return Err(err);
        }

        // The Queued -> Submitted transition doubles as the claim: if a
        // concurrent submitter won it, fall back to observing their run.
        if store
            .update_state(task.id, TaskState::Submitted, "accepted for execution")
            .is_err()
        {
            debug!(task = %task.name, id = task.id, "record claimed by another submitter; waiting");
            return self.await_foreign_completion(task).await;
        }

        // 2. Dependencies: a failed dependency errors this record without
        //    it ever entering Running.
        self.service
            .wait_for_dependencies(&task, self.settings.poll)
            .await_result()
            .await?;

        // 3. Short-circuit: result already present means the external
        //    process is never re-invoked.
        if step.check_ready(&task)? {
            info!(task = %task.name, id = task.id, "declared outputs already exist; skipping execution");
            store.append_event(
                task.id,
                TaskEvent::now(TaskState::Submitted, "outputs already present; external work skipped"),
            )?;
            return self.complete(&task, &step);
        }

        // 4. Execute.
        let script = step.render(&task)?;
        store.update_state(task.id, TaskState::Running, "step process started")?;

        let outcome = match runner
            .run(task.name.clone(), script, task.resources.clone())
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                let _ = store.update_state(task.id, TaskState::Error, &err.to_string());
                return Err(err);
            }
        };

        // 5. Classify captured output: a fatal pattern fails the task even
        //    on exit code zero; whitelisted noise never does.
        let scan = self.classifier.classify(&outcome.combined_output());
        if scan.is_fatal() || !outcome.success() {
            let diagnostic = if scan.is_fatal() {
                scan.diagnostic()
            } else {
                format!("exit code {}", outcome.exit_code)
            };
            let _ = store.update_state(task.id, TaskState::Error, &diagnostic);
            return Err(PipedagError::ProcessFailed {
                task: task.name.clone(),
                diagnostic,
            });
        }

        step.finalize(&task)?;

        // 6. Result readiness: outputs may land after the process exits
        //    (network filesystems); poll rather than trust the exit code.
        if !step.check_ready(&task)? {
            store.update_state(task.id, TaskState::Suspended, "waiting for declared outputs")?;

            let poll_step = Arc::clone(&step);
            let poll_task = task.clone();
            Computation::ready(())
                .suspend_until(
                    format!("outputs of task '{}'", task.name),
                    self.settings.poll,
                    move |_| {
                        let step = Arc::clone(&poll_step);
                        let task = poll_task.clone();
                        async move { Ok(step.check_ready(&task)?.then_some(())) }
                    },
                    |_: &()| true,
                )
                .await_result()
                .await
                .inspect_err(|err| {
                    let _ = store.update_state(task.id, TaskState::Error, &err.to_string());
                })?;

            store.update_state(task.id, TaskState::Running, "declared outputs present")?;
        }

        self.complete(&task, &step)
    }

    /// Collect and persist the result, then mark the record successful.
    fn complete(&self, task: &TaskRecord, step: &Arc<dyn Step>) -> Result<TaskRecord> {
        let store = self.service.store();

        let result = match step.collect_result(task) {
            Ok(result) => result,
            Err(err) => {
                let _ = store.update_state(task.id, TaskState::Error, &err.to_string());
                return Err(err);
            }
        };

        store.store_result(task.id, result)?;
        store.update_state(task.id, TaskState::Successful, "result collected")?;
        store
            .find_by_id(task.id)?
            .ok_or(PipedagError::TaskNotFound(task.id))
    }

    /// Map a reused, already-terminal record to this submission's outcome.
    fn reconcile_terminal(&self, task: TaskRecord) -> Result<TaskRecord> {
        match task.state {
            TaskState::Successful => {
                debug!(task = %task.name, id = task.id, "reusing successful record");
                Ok(task)
            }
            state => Err(PipedagError::ProcessFailed {
                task: task.name.clone(),
                diagnostic: format!("equivalent record {} already terminal in {state:?}", task.id),
            }),
        }
    }

    /// Wait for a record another submitter is driving to reach a terminal
    /// state.
    async fn await_foreign_completion(&self, task: TaskRecord) -> Result<TaskRecord> {
        let service = self.service.clone();
        let id = task.id;

        let terminal = Computation::ready(id)
            .suspend_until(
                format!("task '{}' driven by another submitter", task.name),
                self.settings.poll,
                move |task_id| {
                    let service = service.clone();
                    async move {
                        let record = service
                            .store()
                            .find_by_id(task_id)?
                            .ok_or(PipedagError::TaskNotFound(task_id))?;
                        Ok(record.state.is_terminal().then_some(record))
                    }
                },
                |_| true,
            )
            .await_result()
            .await?;

        self.reconcile_terminal(terminal)
    }
}
