// src/cluster/lifecycle.rs

//! Provision a cluster allocation, launch a driver against it, and
//! guarantee teardown.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::compute::{Computation, PollSettings};
use crate::errors::{PipedagError, Result};
use crate::exec::{BatchScheduler, JobSpec, JobStatus};

use super::allocation::{resolve_control_address, ClusterAllocation, ClusterRequest, ClusterState};
use super::driver::{DriverHandle, DriverRunner, DriverSpec, DriverStatus};

/// Result of one driver run against a cluster.
#[derive(Debug, Clone)]
pub struct DriverOutcome {
    pub app_id: String,
    pub status: DriverStatus,
    pub errors: String,
}

/// Manages the full allocation lifecycle:
/// `Requested -> Provisioning -> Addressable -> AppRunning -> TornDown`.
#[derive(Debug, Clone)]
pub struct ClusterLifecycle {
    scheduler: Arc<dyn BatchScheduler>,
    poll: PollSettings,
}

impl ClusterLifecycle {
    pub fn new(scheduler: Arc<dyn BatchScheduler>, poll: PollSettings) -> Self {
        Self { scheduler, poll }
    }

    /// Submit the sized allocation request. Books the control node plus all
    /// workers in one request; the address is not known yet.
    pub fn submit_allocation(&self, request: &ClusterRequest) -> Result<ClusterAllocation> {
        let mut allocation = ClusterAllocation {
            state: ClusterState::Requested,
            control_job: 0,
            worker_jobs: Vec::new(),
            control_address: None,
            min_workers: request.min_workers,
            node_slots: request.node_slots,
            memory_per_node_gb: request.memory_per_node_gb,
        };

        let spec = JobSpec {
            name: format!("{}-cluster", request.name),
            program: request.program.clone(),
            args: request.args.clone(),
            env: BTreeMap::new(),
            working_dir: request.working_dir.clone(),
            stdout_path: Some(request.working_dir.join("cluster.out")),
            stderr_path: Some(request.working_dir.join("cluster.err")),
            slots: request.total_slots(),
            memory_gb: request.memory_per_node_gb,
            wall_time: None,
            account: request.account.clone(),
            native_spec: Vec::new(),
        };

        let control_job = self.scheduler.submit_job(spec)?;
        info!(
            cluster = %request.name,
            control_job,
            total_slots = request.total_slots(),
            "cluster allocation request accepted"
        );

        allocation.control_job = control_job;
        allocation.state = ClusterState::Provisioning;
        Ok(allocation)
    }

    /// Poll the scheduler until the allocation is running and has at least
    /// one executable host, then resolve the control address.
    ///
    /// An allocation that reaches a terminal state before `Running` fails
    /// the whole provisioning computation; no application may ever be run
    /// against a cluster that died before starting.
    pub fn await_addressable(
        &self,
        allocation: ClusterAllocation,
        control_port: u16,
        poll: PollSettings,
    ) -> Computation<ClusterAllocation> {
        let scheduler = Arc::clone(&self.scheduler);
        let control_job = allocation.control_job;

        Computation::ready(control_job)
            .suspend_until(
                format!("cluster allocation job {control_job} to start running"),
                poll,
                move |job_id| {
                    let scheduler = Arc::clone(&scheduler);
                    async move {
                        let Some(info) = scheduler.job_info(job_id)? else {
                            // Not in the job table yet.
                            return Ok(None);
                        };
                        match info.status {
                            JobStatus::Running => {
                                if info.exec_hosts.iter().any(|h| !h.trim().is_empty()) {
                                    Ok(Some(info))
                                } else {
                                    Ok(None)
                                }
                            }
                            JobStatus::Pending => Ok(None),
                            status => Err(PipedagError::Provisioning(format!(
                                "allocation job {job_id} reached {status:?} before running"
                            ))),
                        }
                    }
                },
                |_| true,
            )
            .then(move |info| {
                match resolve_control_address(&info.exec_hosts, control_port) {
                    Ok(address) => {
                        info!(control_job, address = %address, "cluster is addressable");
                        Computation::ready(ClusterAllocation {
                            state: ClusterState::Addressable,
                            control_address: Some(address),
                            ..allocation
                        })
                    }
                    Err(err) => Computation::failed(err),
                }
            })
    }

    /// Convenience: submit + await addressable with the default poll
    /// settings.
    pub fn provision(&self, request: ClusterRequest) -> Computation<ClusterAllocation> {
        match self.submit_allocation(&request) {
            Ok(allocation) => self.await_addressable(allocation, request.control_port, self.poll),
            Err(err) => Computation::failed(err),
        }
    }

    /// Submit a driver application against an addressable allocation and
    /// poll its completion. If the chain ends while the driver is still
    /// running (timeout, abandonment), the driver is killed.
    pub fn run_driver(
        &self,
        allocation: &ClusterAllocation,
        mut spec: DriverSpec,
        runner: Arc<dyn DriverRunner>,
    ) -> Computation<DriverOutcome> {
        let Some(address) = allocation.control_address.clone() else {
            return Computation::failed(PipedagError::Provisioning(format!(
                "cluster for driver '{}' has no resolved control address",
                spec.name
            )));
        };
        spec.control_address = address;

        let driver_name = spec.name.clone();
        let app_timeout = spec.timeout;

        let handle = match runner.submit(spec) {
            Ok(handle) => handle,
            Err(err) => return Computation::failed(err),
        };

        info!(app = %handle.app_id(), driver = %driver_name, "driver application running");

        // The app's own timeout bounds the completion poll.
        let poll = PollSettings::new(self.poll.interval, app_timeout.or(self.poll.timeout));

        let kill_handle = Arc::clone(&handle);
        Computation::ready(Arc::clone(&handle))
            .suspend_until(
                format!("driver '{driver_name}' to complete"),
                poll,
                move |h: Arc<dyn DriverHandle>| async move { Ok(h.is_done().then_some(())) },
                |_: &()| true,
            )
            .then(move |_| {
                let outcome = DriverOutcome {
                    app_id: handle.app_id(),
                    status: handle.status(),
                    errors: handle.errors(),
                };
                match outcome.status {
                    DriverStatus::Failed => Computation::failed(PipedagError::ProcessFailed {
                        task: driver_name.clone(),
                        diagnostic: outcome.errors.clone(),
                    }),
                    _ => Computation::ready(outcome),
                }
            })
            .on_complete(move |_| {
                if !kill_handle.is_done() {
                    warn!(app = %kill_handle.app_id(), "driver still running at chain end; killing");
                    kill_handle.kill();
                }
            })
    }

    /// Kill every scheduler job identity associated with the allocation.
    ///
    /// Individual kill failures are swallowed and logged so that one
    /// already-dead job does not prevent killing the others. Safe to call
    /// repeatedly and from any state; returns the allocation in its
    /// terminal `TornDown` state.
    pub fn teardown(&self, allocation: &ClusterAllocation) -> ClusterAllocation {
        for job_id in allocation.job_ids() {
            if let Err(err) = self.scheduler.kill_job(job_id) {
                warn!(job_id, error = %err, "kill failed during teardown (job may already be dead)");
            }
        }
        info!(
            control_job = allocation.control_job,
            workers = allocation.worker_jobs.len(),
            "cluster torn down"
        );
        ClusterAllocation {
            state: ClusterState::TornDown,
            ..allocation.clone()
        }
    }

    /// Full orchestration: provision, run the driver, tear down.
    ///
    /// Teardown is attached with `on_complete` immediately after the
    /// allocation request is accepted, so it runs whether the driver
    /// succeeded, the driver failed, or provisioning itself timed out.
    pub fn run(
        &self,
        request: ClusterRequest,
        driver_spec: DriverSpec,
        driver_runner: Arc<dyn DriverRunner>,
    ) -> Computation<DriverOutcome> {
        let allocation = match self.submit_allocation(&request) {
            Ok(allocation) => allocation,
            Err(err) => return Computation::failed(err),
        };

        let submitted = allocation.clone();
        let drive = self.clone();
        let cleanup = self.clone();

        self.await_addressable(allocation, request.control_port, self.poll)
            .then(move |addressable| {
                let active = ClusterAllocation {
                    state: ClusterState::AppRunning,
                    ..addressable
                };
                drive.run_driver(&active, driver_spec, driver_runner)
            })
            .on_complete(move |result| {
                cleanup.teardown(&submitted);
                if let Err(err) = result {
                    warn!(error = %err, "cluster run ended in failure; allocation torn down");
                }
            })
    }
}
