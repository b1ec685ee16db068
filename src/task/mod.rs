// src/task/mod.rs

//! Persistent task records and the dependency graph built over them.
//!
//! - [`record`] defines the unit of work: [`TaskRecord`], its state
//!   machine, and its timestamped event history.
//! - [`store`] is the persistence-collaborator seam: the [`TaskStore`]
//!   trait plus the in-memory system of record.
//! - [`service`] implements the dependency-submission protocol
//!   (idempotent create-if-absent) and readiness checks.

pub mod record;
pub mod service;
pub mod store;

pub use record::{ResourceRequest, TaskEvent, TaskId, TaskRecord, TaskState};
pub use service::{DependencyStatus, TaskService};
pub use store::{InMemoryTaskStore, TaskStore};
