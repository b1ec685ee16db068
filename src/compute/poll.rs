// src/compute/poll.rs

//! Poll-until-ready: resample a condition every interval until a predicate
//! passes or a deadline lapses.
//!
//! This is the only suspension mechanism in the crate. Dependency
//! readiness, step output readiness, and scheduler job-state polling all go
//! through [`Computation::suspend_until`]; nothing busy-waits or calls
//! `thread::sleep`.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::compute::Computation;
use crate::errors::{PipedagError, Result};

/// Interval/timeout pair for a suspend operation.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Delay between consecutive samples.
    pub interval: Duration,
    /// Total time budget; `None` means no deadline.
    pub timeout: Option<Duration>,
}

impl PollSettings {
    pub fn new(interval: Duration, timeout: Option<Duration>) -> Self {
        Self { interval, timeout }
    }

    /// Construct from raw milliseconds as they appear in config.
    ///
    /// A `timeout_ms` of zero means "no timeout".
    pub fn from_millis(interval_ms: u64, timeout_ms: u64) -> Self {
        let timeout = if timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(timeout_ms))
        };
        Self {
            interval: Duration::from_millis(interval_ms.max(1)),
            timeout,
        }
    }
}

impl<T: Clone + Send + 'static> Computation<T> {
    /// Repeatedly evaluate `sample` against this computation's value, then
    /// `ready` against the fresh observation, until the observation is
    /// accepted or `settings.timeout` elapses.
    ///
    /// A `None` observation means "not ready yet", not an error. The k-th
    /// sample happens `k * interval` after the previous value resolved; if
    /// the elapsed time reaches the deadline without an accepted
    /// observation, the computation fails with [`PipedagError::Timeout`].
    ///
    /// `what` names the awaited condition in log lines and timeout errors.
    pub fn suspend_until<O, S, Fut, P>(
        self,
        what: impl Into<String>,
        settings: PollSettings,
        mut sample: S,
        mut ready: P,
    ) -> Computation<O>
    where
        O: Send + 'static,
        S: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<O>>> + Send + 'static,
        P: FnMut(&O) -> bool + Send + 'static,
    {
        let what = what.into();

        self.then(move |value| {
            Computation::supply(move || async move {
                let started = Instant::now();
                let mut samples: u64 = 0;

                loop {
                    sleep(settings.interval).await;
                    samples += 1;

                    match sample(value.clone()).await? {
                        Some(observation) if ready(&observation) => {
                            trace!(
                                what = %what,
                                samples,
                                "condition became ready"
                            );
                            return Ok(observation);
                        }
                        Some(_) => {
                            trace!(what = %what, samples, "observation not accepted yet");
                        }
                        None => {
                            trace!(what = %what, samples, "no observation yet");
                        }
                    }

                    if let Some(limit) = settings.timeout {
                        let elapsed = started.elapsed();
                        if elapsed >= limit {
                            return Err(PipedagError::Timeout {
                                waiting_for: what,
                                elapsed,
                            });
                        }
                    }
                }
            })
        })
    }
}
