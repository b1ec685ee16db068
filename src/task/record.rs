// src/task/record.rs

//! The persistent unit of work and its state machine.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Store-assigned task identity. Zero means "not yet persisted".
pub type TaskId = u64;

/// Lifecycle state of a task record.
///
/// `Created`/`Queued` are set by the submitter; everything after that is
/// mutated exclusively by the engine. `Successful`, `Error` and `Canceled`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Queued,
    Submitted,
    Running,
    Suspended,
    Successful,
    Error,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Successful | TaskState::Error | TaskState::Canceled
        )
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, TaskState::Successful)
    }

    /// Whether moving to `next` is a legal transition.
    ///
    /// Terminal states never transition; `Error` and `Canceled` are
    /// reachable from any non-terminal state (validation can fail a task
    /// that never ran).
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            TaskState::Created => false,
            TaskState::Queued => matches!(self, TaskState::Created),
            TaskState::Submitted => matches!(self, TaskState::Created | TaskState::Queued),
            TaskState::Running => {
                matches!(self, TaskState::Submitted | TaskState::Suspended)
            }
            TaskState::Suspended => matches!(self, TaskState::Submitted | TaskState::Running),
            TaskState::Successful => {
                matches!(self, TaskState::Submitted | TaskState::Running | TaskState::Suspended)
            }
            TaskState::Error | TaskState::Canceled => true,
        }
    }
}

/// One timestamped entry in a task's history.
///
/// Events are strictly time-ordered per task; the store clamps timestamps
/// so a skewed clock can never produce an out-of-order history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub timestamp: SystemTime,
    pub state: TaskState,
    pub note: String,
}

impl TaskEvent {
    pub fn now(state: TaskState, note: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            state,
            note: note.into(),
        }
    }
}

/// Requested processing resources for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Processing slots (cores) to book.
    pub slots: u32,
    /// Requested memory in gigabytes.
    pub memory_gb: u32,
    /// Hard wall-time for the step, if any.
    pub timeout: Option<Duration>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            slots: 1,
            memory_gb: 1,
            timeout: None,
        }
    }
}

/// The persistent unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    /// Owner/subject the task runs on behalf of.
    pub owner: String,
    /// Canonical argument list; part of the equivalence key.
    pub args: Vec<String>,
    pub resources: ResourceRequest,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    /// Timestamped state transitions with free-text annotations.
    pub events: Vec<TaskEvent>,
    /// Serialized result payload, opaque to the engine.
    pub result: Option<serde_json::Value>,
    /// Identities of tasks this one blocks on.
    pub dependencies: Vec<TaskId>,
}

impl TaskRecord {
    pub fn new(name: impl Into<String>, owner: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            state: TaskState::Created,
            owner: owner.into(),
            args,
            resources: ResourceRequest::default(),
            stdout_path: None,
            stderr_path: None,
            events: Vec::new(),
            result: None,
            dependencies: Vec::new(),
        }
    }

    /// Digest of owner + canonical arguments; two records with the same
    /// digest are "the same work" for dependency-submission purposes.
    pub fn canonical_digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.owner.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.name.as_bytes());
        hasher.update(&[0]);
        for arg in &self.args {
            hasher.update(arg.as_bytes());
            hasher.update(&[0]);
        }
        hasher.finalize().to_hex().to_string()
    }
}
