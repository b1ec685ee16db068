// src/task/service.rs

//! Dependency-submission protocol and readiness checks over the store.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::compute::{Computation, PollSettings};
use crate::errors::{PipedagError, Result};
use crate::task::record::{TaskId, TaskRecord, TaskState};
use crate::task::store::TaskStore;
use crate::types::CanceledDependencyPolicy;

/// Aggregate state of a task's declared dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyStatus {
    /// Every dependency reached a terminal successful state.
    AllDone,
    /// At least one dependency has not terminated yet.
    Waiting,
    /// A dependency terminated in error (or canceled, under the `failure`
    /// policy); the parent must not run.
    Failed { dependency: TaskId, state: TaskState },
}

/// Operations over task records: idempotent dependency submission and
/// dependency readiness.
#[derive(Debug, Clone)]
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    canceled_policy: CanceledDependencyPolicy,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>, canceled_policy: CanceledDependencyPolicy) -> Self {
        Self {
            store,
            canceled_policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Look up an existing task equivalent to `candidate` (same owner, same
    /// canonical arguments) and return it if found in any non-canceled
    /// state; otherwise persist `candidate` as new.
    ///
    /// Idempotent under retries and concurrent re-entrant calls: two
    /// callers racing to submit "the same" dependency converge on one
    /// record.
    pub fn submit_dependency_if_not_found(&self, candidate: TaskRecord) -> Result<TaskRecord> {
        let name = candidate.name.clone();
        let record = self.store.create_if_absent(candidate)?;
        info!(task = %name, id = record.id, state = ?record.state, "dependency submitted");
        Ok(record)
    }

    /// Evaluate the aggregate state of `task`'s declared dependencies.
    pub fn dependency_status(&self, task: &TaskRecord) -> Result<DependencyStatus> {
        let mut all_done = true;

        for dep_id in &task.dependencies {
            let dep = self
                .store
                .find_by_id(*dep_id)?
                .ok_or(PipedagError::TaskNotFound(*dep_id))?;

            match dep.state {
                TaskState::Successful => {}
                TaskState::Error => {
                    return Ok(DependencyStatus::Failed {
                        dependency: *dep_id,
                        state: dep.state,
                    });
                }
                TaskState::Canceled => match self.canceled_policy {
                    CanceledDependencyPolicy::Success => {}
                    CanceledDependencyPolicy::Failure => {
                        return Ok(DependencyStatus::Failed {
                            dependency: *dep_id,
                            state: dep.state,
                        });
                    }
                },
                _ => {
                    all_done = false;
                }
            }
        }

        if all_done {
            Ok(DependencyStatus::AllDone)
        } else {
            Ok(DependencyStatus::Waiting)
        }
    }

    /// True only when every declared dependency is in a terminal state that
    /// counts as satisfied.
    pub fn are_all_dependencies_done(&self, task: &TaskRecord) -> Result<bool> {
        Ok(matches!(
            self.dependency_status(task)?,
            DependencyStatus::AllDone
        ))
    }

    /// Suspend until every dependency of `task` is satisfied.
    ///
    /// A dependency ending in error fails the computation *and* transitions
    /// the parent to `Error` with an event recording which dependency
    /// failed; the parent never becomes eligible to run.
    ///
    /// A task with zero dependencies resolves immediately, without waiting
    /// a poll interval.
    pub fn wait_for_dependencies(
        &self,
        task: &TaskRecord,
        settings: PollSettings,
    ) -> Computation<()> {
        // Immediate check first: the common zero-dependency case (and any
        // already-satisfied set) must not pay a poll interval.
        match self.check_and_propagate(task) {
            Ok(Some(())) => return Computation::ready(()),
            Ok(None) => {}
            Err(err) => return Computation::failed(err),
        }

        debug!(
            task = %task.name,
            id = task.id,
            deps = task.dependencies.len(),
            "suspending until dependencies are done"
        );

        let service = self.clone();
        let task = task.clone();
        let what = format!("dependencies of task '{}'", task.name);

        Computation::ready(()).suspend_until(
            what,
            settings,
            move |_| {
                let service = service.clone();
                let task = task.clone();
                async move { service.check_and_propagate(&task) }
            },
            |_: &()| true,
        )
    }

    /// Single dependency probe: `Some(())` when satisfied, `None` while
    /// waiting, error (with the parent transitioned to `Error`) on a failed
    /// dependency.
    fn check_and_propagate(&self, task: &TaskRecord) -> Result<Option<()>> {
        match self.dependency_status(task)? {
            DependencyStatus::AllDone => Ok(Some(())),
            DependencyStatus::Waiting => Ok(None),
            DependencyStatus::Failed { dependency, state } => {
                let reason = format!("dependency task {dependency} terminated in {state:?}");
                warn!(task = %task.name, id = task.id, dependency, "dependency failed; failing parent");
                self.store.update_state(task.id, TaskState::Error, &reason)?;
                Err(PipedagError::DependencyFailed {
                    task: task.name.clone(),
                    dependency: dependency.to_string(),
                    reason,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::store::InMemoryTaskStore;

    fn service(policy: CanceledDependencyPolicy) -> TaskService {
        TaskService::new(Arc::new(InMemoryTaskStore::new()), policy)
    }

    fn submit(service: &TaskService, name: &str, deps: Vec<TaskId>) -> TaskRecord {
        let mut r = TaskRecord::new(name, "owner", vec![name.to_string()]);
        r.dependencies = deps;
        service.submit_dependency_if_not_found(r).unwrap()
    }

    #[test]
    fn resubmission_returns_same_identity() {
        let svc = service(CanceledDependencyPolicy::Failure);
        let a = submit(&svc, "convert", vec![]);
        let b = submit(&svc, "convert", vec![]);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn status_reflects_dependency_states() {
        let svc = service(CanceledDependencyPolicy::Failure);
        let dep = submit(&svc, "dep", vec![]);
        let parent = submit(&svc, "parent", vec![dep.id]);

        assert_eq!(
            svc.dependency_status(&parent).unwrap(),
            DependencyStatus::Waiting
        );

        svc.store()
            .update_state(dep.id, TaskState::Submitted, "go")
            .unwrap();
        svc.store()
            .update_state(dep.id, TaskState::Running, "running")
            .unwrap();
        svc.store()
            .update_state(dep.id, TaskState::Successful, "done")
            .unwrap();

        assert_eq!(
            svc.dependency_status(&parent).unwrap(),
            DependencyStatus::AllDone
        );
    }

    #[test]
    fn canceled_dependency_follows_policy() {
        for (policy, expect_done) in [
            (CanceledDependencyPolicy::Success, true),
            (CanceledDependencyPolicy::Failure, false),
        ] {
            let svc = service(policy);
            let dep = submit(&svc, "dep", vec![]);
            let parent = submit(&svc, "parent", vec![dep.id]);

            svc.store()
                .update_state(dep.id, TaskState::Canceled, "canceled")
                .unwrap();

            let status = svc.dependency_status(&parent).unwrap();
            if expect_done {
                assert_eq!(status, DependencyStatus::AllDone);
            } else {
                assert!(matches!(status, DependencyStatus::Failed { .. }));
            }
        }
    }

    #[tokio::test]
    async fn failed_dependency_fails_parent_without_running() {
        let svc = service(CanceledDependencyPolicy::Failure);
        let dep = submit(&svc, "dep", vec![]);
        let parent = submit(&svc, "parent", vec![dep.id]);

        svc.store()
            .update_state(dep.id, TaskState::Error, "segfault")
            .unwrap();

        let out = svc
            .wait_for_dependencies(&parent, PollSettings::from_millis(10, 1_000))
            .await_result()
            .await;
        assert!(matches!(out, Err(PipedagError::DependencyFailed { .. })));

        let reloaded = svc.store().find_by_id(parent.id).unwrap().unwrap();
        assert_eq!(reloaded.state, TaskState::Error);
        // The event history must cite the failed dependency.
        assert!(reloaded
            .events
            .iter()
            .any(|e| e.note.contains(&dep.id.to_string())));
    }

    #[tokio::test]
    async fn zero_dependencies_resolve_immediately() {
        let svc = service(CanceledDependencyPolicy::Failure);
        let task = submit(&svc, "solo", vec![]);

        // A generous interval would stall this test if the immediate check
        // were missing.
        let out = svc
            .wait_for_dependencies(&task, PollSettings::from_millis(60_000, 0))
            .await_result()
            .await;
        assert!(out.is_ok());
    }
}
