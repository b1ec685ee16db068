// src/cluster/runner.rs

//! Adapter that runs a step as a driver application on a freshly
//! provisioned cluster.
//!
//! Implements [`ProcessRunner`], so a cluster-backed task flows through
//! the service engine exactly like a locally executed one: the engine
//! renders the script, this runner provisions an allocation sized from
//! the configured node geometry, launches the script as the driver, and
//! tears the allocation down no matter how the run ends.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::cluster::allocation::ClusterRequest;
use crate::cluster::driver::{DriverRunner, DriverSpec};
use crate::cluster::lifecycle::ClusterLifecycle;
use crate::errors::Result;
use crate::exec::runner::{ProcessOutcome, ProcessRunner};
use crate::step::StepScript;
use crate::task::ResourceRequest;

/// Cluster geometry shared by all cluster-backed tasks.
#[derive(Debug, Clone)]
pub struct ClusterGeometry {
    /// Command that boots a cluster node.
    pub node_program: String,
    pub node_args: Vec<String>,
    /// Worker nodes per allocation.
    pub workers: u32,
    pub node_slots: u32,
    pub memory_per_node_gb: u32,
    pub min_workers: u32,
    pub control_port: u16,
    pub account: Option<String>,
}

#[derive(Debug)]
pub struct ClusterStepRunner {
    lifecycle: ClusterLifecycle,
    driver_runner: Arc<dyn DriverRunner>,
    geometry: ClusterGeometry,
}

impl ClusterStepRunner {
    pub fn new(
        lifecycle: ClusterLifecycle,
        driver_runner: Arc<dyn DriverRunner>,
        geometry: ClusterGeometry,
    ) -> Self {
        Self {
            lifecycle,
            driver_runner,
            geometry,
        }
    }
}

impl ProcessRunner for ClusterStepRunner {
    fn run(
        &self,
        task_name: String,
        script: StepScript,
        resources: ResourceRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessOutcome>> + Send + '_>> {
        let lifecycle = self.lifecycle.clone();
        let driver_runner = Arc::clone(&self.driver_runner);
        let geometry = self.geometry.clone();

        Box::pin(async move {
            let request = ClusterRequest {
                name: task_name.clone(),
                program: geometry.node_program.clone(),
                args: geometry.node_args.clone(),
                workers: geometry.workers,
                node_slots: geometry.node_slots,
                memory_per_node_gb: geometry.memory_per_node_gb,
                min_workers: geometry.min_workers,
                account: geometry.account.clone(),
                control_port: geometry.control_port,
                working_dir: script.working_dir.clone(),
            };

            let driver_spec = DriverSpec {
                name: task_name.clone(),
                // Filled in by the lifecycle once the allocation is
                // addressable.
                control_address: String::new(),
                resource_path: None,
                entry_point: script.program.clone(),
                args: script.args.clone(),
                output_dir: script
                    .stdout_path
                    .as_ref()
                    .and_then(|p| p.parent().map(PathBuf::from))
                    .unwrap_or_else(|| script.working_dir.clone()),
                error_dir: script
                    .stderr_path
                    .as_ref()
                    .and_then(|p| p.parent().map(PathBuf::from))
                    .unwrap_or_else(|| script.working_dir.clone()),
                sizing: script.env.clone(),
                cores: resources.slots,
                account: geometry.account.clone(),
                timeout: resources.timeout,
            };

            let outcome = lifecycle
                .run(request, driver_spec, driver_runner)
                .await_result()
                .await?;

            // A surviving driver outcome is a success by construction;
            // failures surfaced as errors above.
            Ok(ProcessOutcome {
                exit_code: 0,
                stdout: String::new(),
                stderr: outcome.errors,
            })
        })
    }
}
