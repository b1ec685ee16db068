// src/config/mod.rs

//! Pipeline configuration.
//!
//! - [`model`] maps the TOML file to typed sections.
//! - [`loader`] reads and validates a config file from disk.
//! - [`validate`] checks semantic rules (known dependencies, acyclic
//!   graph, sane resources).

pub mod loader;
pub mod model;
pub mod validate;

pub use model::{
    ClusterSection, ConfigFile, DefaultSection, EngineSection, RawConfigFile, TaskConfig,
};
pub use validate::topo_order;
