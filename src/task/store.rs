// src/task/store.rs

//! Persistence collaborator for task records.
//!
//! The store is the system of record; the engine owns all mutation and
//! goes through this seam so that a real database can replace
//! [`InMemoryTaskStore`] without touching engine code.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::errors::{PipedagError, Result};
use crate::task::record::{TaskEvent, TaskId, TaskRecord, TaskState};

/// Abstract task persistence interface.
pub trait TaskStore: Send + Sync + Debug {
    /// Persist a new record, assigning its identity.
    fn create(&self, record: TaskRecord) -> Result<TaskRecord>;

    fn find_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>>;

    /// Find an existing record equivalent to (owner, digest) in any
    /// non-canceled state.
    fn find_equivalent(&self, owner: &str, digest: &str) -> Result<Option<TaskRecord>>;

    /// Atomic create-if-absent: return an equivalent existing record in any
    /// non-canceled state, or persist `record` as new and return it.
    ///
    /// Two callers racing to submit the same work must converge on one
    /// record.
    fn create_if_absent(&self, record: TaskRecord) -> Result<TaskRecord>;

    /// Append a free-text event to a task's history.
    fn append_event(&self, id: TaskId, event: TaskEvent) -> Result<()>;

    /// Transition a task's state, recording an event with `note`.
    fn update_state(&self, id: TaskId, state: TaskState, note: &str) -> Result<()>;

    /// Attach the serialized result payload.
    fn store_result(&self, id: TaskId, result: serde_json::Value) -> Result<()>;
}

/// Mutex-backed in-memory system of record.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: TaskId,
    records: HashMap<TaskId, TaskRecord>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn assign_id(&mut self) -> TaskId {
        self.next_id += 1;
        self.next_id
    }

    fn insert(&mut self, mut record: TaskRecord) -> TaskRecord {
        record.id = self.assign_id();
        if record.state == TaskState::Created {
            record.state = TaskState::Queued;
        }
        record.events.push(TaskEvent::now(record.state, "persisted"));
        self.records.insert(record.id, record.clone());
        record
    }

    fn find_equivalent(&self, owner: &str, digest: &str) -> Option<&TaskRecord> {
        self.records.values().find(|r| {
            r.owner == owner && r.state != TaskState::Canceled && r.canonical_digest() == digest
        })
    }

    /// Keep the per-task history strictly time-ordered even if the wall
    /// clock steps backwards between appends.
    fn push_event(&mut self, id: TaskId, mut event: TaskEvent) -> Result<()> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(PipedagError::TaskNotFound(id))?;
        if let Some(last) = record.events.last() {
            if event.timestamp < last.timestamp {
                event.timestamp = last.timestamp;
            }
        }
        record.events.push(event);
        Ok(())
    }
}

impl TaskStore for InMemoryTaskStore {
    fn create(&self, record: TaskRecord) -> Result<TaskRecord> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.insert(record);
        debug!(task = %record.name, id = record.id, "created task record");
        Ok(record)
    }

    fn find_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.get(&id).cloned())
    }

    fn find_equivalent(&self, owner: &str, digest: &str) -> Result<Option<TaskRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.find_equivalent(owner, digest).cloned())
    }

    fn create_if_absent(&self, record: TaskRecord) -> Result<TaskRecord> {
        let mut inner = self.inner.lock().unwrap();
        let digest = record.canonical_digest();

        if let Some(existing) = inner.find_equivalent(&record.owner, &digest) {
            debug!(
                task = %existing.name,
                id = existing.id,
                "equivalent task already present; reusing"
            );
            return Ok(existing.clone());
        }

        let record = inner.insert(record);
        debug!(task = %record.name, id = record.id, "no equivalent task; created new record");
        Ok(record)
    }

    fn append_event(&self, id: TaskId, event: TaskEvent) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.push_event(id, event)
    }

    fn update_state(&self, id: TaskId, state: TaskState, note: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let current = inner
            .records
            .get(&id)
            .ok_or(PipedagError::TaskNotFound(id))?
            .state;

        if !current.can_transition_to(state) {
            warn!(
                id,
                ?current,
                next = ?state,
                "rejecting illegal state transition"
            );
            return Err(PipedagError::Validation(format!(
                "illegal transition {current:?} -> {state:?} for task {id}"
            )));
        }

        if let Some(record) = inner.records.get_mut(&id) {
            record.state = state;
        }
        inner.push_event(id, TaskEvent::now(state, note))
    }

    fn store_result(&self, id: TaskId, result: serde_json::Value) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(PipedagError::TaskNotFound(id))?;
        record.result = Some(result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, owner: &str, args: &[&str]) -> TaskRecord {
        TaskRecord::new(name, owner, args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn create_assigns_ids_and_queues() {
        let store = InMemoryTaskStore::new();
        let a = store.create(record("a", "o", &[])).unwrap();
        let b = store.create(record("b", "o", &[])).unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.state, TaskState::Queued);
        assert_eq!(store.find_by_id(a.id).unwrap().unwrap().name, "a");
    }

    #[test]
    fn create_if_absent_reuses_equivalent() {
        let store = InMemoryTaskStore::new();
        let first = store
            .create_if_absent(record("convert", "o", &["x"]))
            .unwrap();
        let second = store
            .create_if_absent(record("convert", "o", &["x"]))
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn create_if_absent_skips_canceled() {
        let store = InMemoryTaskStore::new();
        let first = store
            .create_if_absent(record("convert", "o", &["x"]))
            .unwrap();
        store
            .update_state(first.id, TaskState::Canceled, "operator canceled")
            .unwrap();

        let second = store
            .create_if_absent(record("convert", "o", &["x"]))
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn update_state_rejects_terminal_transitions() {
        let store = InMemoryTaskStore::new();
        let t = store.create(record("a", "o", &[])).unwrap();
        store
            .update_state(t.id, TaskState::Error, "validation failed")
            .unwrap();
        let err = store.update_state(t.id, TaskState::Running, "nope");
        assert!(err.is_err());
    }

    #[test]
    fn events_stay_time_ordered() {
        let store = InMemoryTaskStore::new();
        let t = store.create(record("a", "o", &[])).unwrap();

        // An event carrying an older timestamp than the last one gets
        // clamped forward rather than breaking the ordering invariant.
        let stale = TaskEvent {
            timestamp: std::time::UNIX_EPOCH,
            state: TaskState::Queued,
            note: "stale clock".into(),
        };
        store.append_event(t.id, stale).unwrap();

        let events = store.find_by_id(t.id).unwrap().unwrap().events;
        for pair in events.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }
}
