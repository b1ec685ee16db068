// src/compute/computation.rs

//! `Computation<T>`: an opaque handle to a value that will become available
//! later, or fail with a typed [`PipedagError`].
//!
//! Exactly one of {value, failure} ever occurs. Suppliers are spawned
//! eagerly on the tokio runtime, so combinators never block the calling
//! thread and never re-execute side effects that already ran: `map` on a
//! completed handle transforms the stored value synchronously, without
//! touching the supplier again. A handle created with [`Computation::ready`]
//! resolves without any scheduling overhead.

use std::future::Future;

use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::{PipedagError, Result};

enum State<T> {
    /// Already complete; resolves synchronously.
    Ready(Result<T>),
    /// Waiting on an eagerly spawned supplier.
    Pending(oneshot::Receiver<Result<T>>),
}

pub struct Computation<T> {
    state: State<T>,
}

impl<T: Send + 'static> Computation<T> {
    /// A computation that is already complete with `value`.
    pub fn ready(value: T) -> Self {
        Self {
            state: State::Ready(Ok(value)),
        }
    }

    /// A computation that is already complete with a failure.
    pub fn failed(err: PipedagError) -> Self {
        Self {
            state: State::Ready(Err(err)),
        }
    }

    /// Spawn `f` on the runtime immediately and return a handle to its
    /// eventual outcome.
    pub fn supply<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = f().await;
            // The receiver may have been dropped; the outcome is then
            // intentionally discarded.
            let _ = tx.send(outcome);
        });
        Self {
            state: State::Pending(rx),
        }
    }

    /// Await the outcome, consuming the handle.
    pub async fn await_result(self) -> Result<T> {
        match self.state {
            State::Ready(res) => res,
            State::Pending(rx) => recv(rx).await,
        }
    }

    /// Transform a successful value. Failures pass through unchanged.
    pub fn map<U, F>(self, f: F) -> Computation<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self.state {
            State::Ready(Ok(value)) => Computation::ready(f(value)),
            State::Ready(Err(err)) => Computation::failed(err),
            State::Pending(rx) => {
                Computation::supply(move || async move { recv(rx).await.map(f) })
            }
        }
    }

    /// Sequence a second computation that depends on this one's value.
    pub fn then<U, F>(self, f: F) -> Computation<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Computation<U> + Send + 'static,
    {
        match self.state {
            State::Ready(Ok(value)) => f(value),
            State::Ready(Err(err)) => Computation::failed(err),
            State::Pending(rx) => Computation::supply(move || async move {
                let value = recv(rx).await?;
                f(value).await_result().await
            }),
        }
    }

    /// Wait for every member of a dynamically sized list and combine the
    /// results.
    ///
    /// Fails with the first (by list order) failure. Siblings are not
    /// cancelled: they were spawned eagerly and run to completion, so the
    /// successes that did happen remain observable for diagnosis.
    pub fn combine_all<U, F>(list: Vec<Computation<T>>, f: F) -> Computation<U>
    where
        U: Send + 'static,
        F: FnOnce(Vec<T>) -> U + Send + 'static,
    {
        Computation::supply(move || async move {
            let total = list.len();
            let mut values = Vec::with_capacity(total);
            let mut first_failure: Option<PipedagError> = None;

            for member in list {
                match member.await_result().await {
                    Ok(value) => values.push(value),
                    Err(err) => {
                        if first_failure.is_none() {
                            first_failure = Some(err);
                        }
                    }
                }
            }

            match first_failure {
                Some(err) => {
                    debug!(
                        succeeded = values.len(),
                        total, "combine_all member failed; surfacing first failure"
                    );
                    Err(err)
                }
                None => Ok(f(values)),
            }
        })
    }

    /// Combine this computation with a list of siblings.
    pub fn combine<U, F>(self, siblings: Vec<Computation<T>>, f: F) -> Computation<U>
    where
        U: Send + 'static,
        F: FnOnce(T, Vec<T>) -> U + Send + 'static,
    {
        self.then(move |first| Computation::combine_all(siblings, move |rest| f(first, rest)))
    }

    /// Observe success-or-failure without altering the outcome.
    ///
    /// This is the guaranteed-cleanup hook: `f` runs whether the chain
    /// succeeded, failed, or was abandoned.
    pub fn on_complete<F>(self, f: F) -> Computation<T>
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        match self.state {
            State::Ready(res) => {
                f(&res);
                Self { state: State::Ready(res) }
            }
            State::Pending(rx) => Computation::supply(move || async move {
                let res = recv(rx).await;
                f(&res);
                res
            }),
        }
    }
}

async fn recv<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await.unwrap_or_else(|_| {
        Err(PipedagError::Abandoned(
            "supplier dropped without completing".to_string(),
        ))
    })
}
