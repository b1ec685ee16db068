// src/engine/mod.rs

//! The service-computation engine.
//!
//! [`ServiceEngine`] drives one persisted task record through its whole
//! lifecycle as a [`Computation`](crate::compute::Computation) chain:
//! validate, wait for dependencies, execute (or short-circuit when the
//! result already exists), classify output, collect the result. Cleanup
//! hooks run on every outcome.

pub mod service;

pub use service::{EngineSettings, ServiceEngine};
