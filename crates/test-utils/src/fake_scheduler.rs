use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use pipedag::errors::{PipedagError, Result};
use pipedag::exec::{BatchScheduler, JobId, JobInfo, JobSpec, JobStatus};

/// A fake batch scheduler driven by scripted per-job status sequences.
///
/// Each submission consumes the next queued plan: a sequence of
/// `Option<JobInfo>` observations returned by successive `job_info` calls
/// (`None` meaning "not in the job table yet"). The last observation
/// repeats forever. With no plan queued, a job reports `Running` on a
/// single fake host and then stays there.
///
/// Kill requests are recorded; individual jobs can be scripted to fail
/// their kill (for teardown tolerance tests).
#[derive(Debug, Default)]
pub struct FakeScheduler {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: JobId,
    plans: VecDeque<Vec<Option<JobInfo>>>,
    jobs: HashMap<JobId, JobScript>,
    submitted: Vec<JobSpec>,
    kills: Vec<JobId>,
    failing_kills: Vec<JobId>,
}

#[derive(Debug)]
struct JobScript {
    observations: Vec<Option<JobInfo>>,
    cursor: usize,
}

pub fn info(status: JobStatus, hosts: &[&str], exit_code: Option<i32>) -> JobInfo {
    JobInfo {
        status,
        exec_hosts: hosts.iter().map(|h| h.to_string()).collect(),
        exit_code,
        resource_usage: None,
    }
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the observation sequence for the next submitted job.
    pub fn plan_job(&self, observations: Vec<Option<JobInfo>>) {
        self.inner.lock().unwrap().plans.push_back(observations);
    }

    /// Plan a job that is pending once, then running on `host`, forever.
    pub fn plan_running(&self, host: &str) {
        self.plan_job(vec![
            Some(info(JobStatus::Pending, &[], None)),
            Some(info(JobStatus::Running, &[host], None)),
        ]);
    }

    /// Plan a job that runs on `host` and then completes successfully.
    pub fn plan_running_then_done(&self, host: &str) {
        self.plan_job(vec![
            Some(info(JobStatus::Running, &[host], None)),
            Some(info(JobStatus::Done, &[host], Some(0))),
        ]);
    }

    /// Plan a job that dies before ever running.
    pub fn plan_dead_on_arrival(&self) {
        self.plan_job(vec![
            None,
            Some(info(JobStatus::Pending, &[], None)),
            Some(info(JobStatus::Failed, &[], Some(1))),
        ]);
    }

    /// Make kill requests for the given job id return an error.
    pub fn fail_kills_for(&self, id: JobId) {
        self.inner.lock().unwrap().failing_kills.push(id);
    }

    pub fn submitted_specs(&self) -> Vec<JobSpec> {
        self.inner.lock().unwrap().submitted.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.inner.lock().unwrap().submitted.len()
    }

    pub fn kills(&self) -> Vec<JobId> {
        self.inner.lock().unwrap().kills.clone()
    }

    pub fn kill_count(&self, id: JobId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .kills
            .iter()
            .filter(|k| **k == id)
            .count()
    }
}

impl BatchScheduler for FakeScheduler {
    fn submit_job(&self, spec: JobSpec) -> Result<JobId> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;

        let observations = inner.plans.pop_front().unwrap_or_else(|| {
            vec![Some(info(JobStatus::Running, &["fake-host"], None))]
        });

        inner.submitted.push(spec);
        inner.jobs.insert(
            id,
            JobScript {
                observations,
                cursor: 0,
            },
        );
        Ok(id)
    }

    fn job_info(&self, id: JobId) -> Result<Option<JobInfo>> {
        let mut inner = self.inner.lock().unwrap();
        let script = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PipedagError::Provisioning(format!("unknown job {id}")))?;

        if script.observations.is_empty() {
            return Ok(None);
        }
        let index = script.cursor.min(script.observations.len() - 1);
        if script.cursor < script.observations.len() {
            script.cursor += 1;
        }
        Ok(script.observations[index].clone())
    }

    fn kill_job(&self, id: JobId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.kills.push(id);
        if inner.failing_kills.contains(&id) {
            return Err(PipedagError::Provisioning(format!(
                "kill of job {id} rejected (already dead)"
            )));
        }
        Ok(())
    }
}
