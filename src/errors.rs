// src/errors.rs

//! Crate-wide error type and helpers.
//!
//! Every failure the engine can surface is a variant here, so callers can
//! match on the taxonomy (validation, dependency failure, process failure,
//! provisioning, timeout) instead of string-scraping.

use std::time::Duration;

use thiserror::Error;

use crate::task::TaskId;

#[derive(Error, Debug)]
pub enum PipedagError {
    /// Malformed or missing arguments, caught before any external work.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Cycle detected in dependency graph: {0}")]
    DependencyCycle(String),

    /// A declared dependency terminated in error (or canceled, under the
    /// `failure` policy); propagated to the parent task.
    #[error("Dependency '{dependency}' of task '{task}' failed: {reason}")]
    DependencyFailed {
        task: String,
        dependency: String,
        reason: String,
    },

    /// The wrapped external process failed, with the classified diagnostic
    /// text from its captured streams.
    #[error("External process failed for task '{task}': {diagnostic}")]
    ProcessFailed { task: String, diagnostic: String },

    /// The batch scheduler allocation never became usable.
    #[error("Cluster provisioning failed: {0}")]
    Provisioning(String),

    /// A suspend operation exceeded its deadline.
    #[error("Timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        elapsed: Duration,
    },

    /// The task evaluating a computation went away without producing a
    /// value (runtime shutdown, panic in the supplier).
    #[error("Computation abandoned: {0}")]
    Abandoned(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, PipedagError>;
