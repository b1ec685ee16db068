// src/cluster/mod.rs

//! Batch-cluster lifecycle management.
//!
//! - [`allocation`] models a provisioned multi-node allocation and its
//!   state machine, including control-address resolution.
//! - [`driver`] defines the two interchangeable driver-submission
//!   strategies (in-process vs. batch-submitted) behind one handle.
//! - [`lifecycle`] provisions an allocation, launches a driver against it,
//!   monitors completion, and guarantees teardown.
//! - [`runner`] adapts the whole lifecycle to the
//!   [`ProcessRunner`](crate::exec::ProcessRunner) seam, so a
//!   cluster-backed task flows through the engine like any other step.

pub mod allocation;
pub mod driver;
pub mod lifecycle;
pub mod runner;

pub use allocation::{
    resolve_control_address, ClusterAllocation, ClusterRequest, ClusterState,
    DEFAULT_CONTROL_PORT,
};
pub use driver::{
    BatchDriverRunner, DriverHandle, DriverRunner, DriverSpec, DriverStatus, LocalDriverRunner,
};
pub use lifecycle::{ClusterLifecycle, DriverOutcome};
pub use runner::{ClusterGeometry, ClusterStepRunner};
