// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Coordinated shutdown of groups of tasks.
//!
//! A [`Stopper`] owns a group of asynchronous tasks and a list of closers.
//! Stopping proceeds in two phases:
//!
//!  1. **Quiesce.** The stopper stops accepting new tasks and signals
//!     [`Stopper::should_quiesce`] to every interested party. Tasks are
//!     expected to observe this signal and wind down.
//!  2. **Stop.** Once every task has exited, the closers run in the order in
//!     which they were registered, and [`Stopper::stopped`] resolves.
//!
//! Stoppers are commonly chained: a task running on one stopper watches the
//! quiesce signal of another and stops a third in response.

use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex};

use derivative::Derivative;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;

use crate::task;

/// The error returned when a task is started on a [`Stopper`] that has begun
/// quiescing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot start task {task:?}: stopper is quiescing")]
pub struct QuiescingError {
    /// The name of the task that was refused.
    pub task: String,
}

/// A cloneable handle to a group of tasks that can be stopped together.
///
/// See the [module documentation](self) for details.
#[derive(Debug, Clone, Default)]
pub struct Stopper {
    inner: Arc<StopperInner>,
}

#[derive(Debug, Default)]
struct StopperInner {
    /// Cancelled when quiescing begins.
    quiesce: CancellationToken,
    /// Cancelled once all tasks have exited and all closers have run.
    stopped: CancellationToken,
    tasks: TaskTracker,
    state: Mutex<StopperState>,
}

#[derive(Derivative, Default)]
#[derivative(Debug)]
struct StopperState {
    quiescing: bool,
    /// Set once the closers have been taken for execution.
    closed: bool,
    #[derivative(Debug = "ignore")]
    closers: Vec<Box<dyn FnOnce() + Send>>,
}

impl Stopper {
    /// Creates a new stopper with no tasks.
    pub fn new() -> Stopper {
        Stopper::default()
    }

    /// Spawns `future` as a task owned by this stopper.
    ///
    /// Returns an error, without spawning anything, if the stopper has begun
    /// quiescing. A successfully spawned task delays the completion of
    /// [`Stopper::stop`] until it exits.
    pub fn run_async_task<F>(&self, name: &str, future: F) -> Result<(), QuiescingError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Holding the state lock orders this check against `quiesce`, so no
        // task can sneak in after the tracker has been closed.
        let state = self.inner.state.lock().expect("lock poisoned");
        if state.quiescing {
            return Err(QuiescingError {
                task: name.to_string(),
            });
        }
        let name = name.to_string();
        let _ = task::spawn(|| name, self.inner.tasks.track_future(future));
        Ok(())
    }

    /// Returns a future that resolves once this stopper begins quiescing.
    pub fn should_quiesce(&self) -> WaitForCancellationFuture<'_> {
        self.inner.quiesce.cancelled()
    }

    /// Reports whether this stopper has begun quiescing.
    pub fn is_quiescing(&self) -> bool {
        self.inner.quiesce.is_cancelled()
    }

    /// Returns a token that is cancelled when this stopper begins quiescing.
    ///
    /// The token may also be cancelled independently by its holder, which
    /// does not affect the stopper.
    pub fn with_cancel_on_quiesce(&self) -> CancellationToken {
        self.inner.quiesce.child_token()
    }

    /// Registers a closer to run after all tasks have exited.
    ///
    /// Closers run exactly once, in registration order. If the stopper has
    /// already run its closers, `closer` runs immediately on the calling
    /// thread.
    pub fn add_closer<F>(&self, closer: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        if state.closed {
            drop(state);
            closer();
        } else {
            state.closers.push(Box::new(closer));
        }
    }

    /// Begins quiescing without waiting for the stopper to stop.
    ///
    /// Completion (waiting for tasks and running closers) happens in the
    /// background and can be observed with [`Stopper::stopped`]. Calling this
    /// method more than once has no further effect.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a Tokio runtime.
    pub fn quiesce(&self) {
        {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            if state.quiescing {
                return;
            }
            state.quiescing = true;
            self.inner.quiesce.cancel();
            self.inner.tasks.close();
        }
        let inner = Arc::clone(&self.inner);
        let _ = task::spawn(
            || "stopper-finish",
            async move {
                inner.tasks.wait().await;
                let closers = {
                    let mut state = inner.state.lock().expect("lock poisoned");
                    state.closed = true;
                    mem::take(&mut state.closers)
                };
                for closer in closers {
                    closer();
                }
                inner.stopped.cancel();
            },
        );
    }

    /// Quiesces the stopper and waits until it has stopped.
    ///
    /// It is safe to call this method concurrently and repeatedly; every call
    /// returns only once all tasks have exited and all closers have run.
    /// Dropping the returned future does not interrupt the stop.
    ///
    /// A task owned by this stopper must not await this method, as the stop
    /// cannot complete before the task exits. Such tasks call
    /// [`Stopper::quiesce`] instead.
    pub async fn stop(&self) {
        self.quiesce();
        self.stopped().await;
    }

    /// Waits until the stopper has stopped, without initiating a stop.
    pub async fn stopped(&self) {
        self.inner.stopped.cancelled().await
    }

    /// Reports whether the stopper has stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[crate::test(tokio::test)]
    async fn stop_waits_for_tasks() {
        let stopper = Stopper::new();
        let finished = Arc::new(AtomicBool::new(false));
        stopper
            .run_async_task("worker", {
                let stopper = stopper.clone();
                let finished = Arc::clone(&finished);
                async move {
                    stopper.should_quiesce().await;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    finished.store(true, Ordering::SeqCst);
                }
            })
            .unwrap();
        assert!(!stopper.is_quiescing());
        stopper.stop().await;
        assert!(stopper.is_quiescing());
        assert!(stopper.is_stopped());
        assert!(finished.load(Ordering::SeqCst));
    }

    #[crate::test(tokio::test)]
    async fn run_async_task_refused_after_quiesce() {
        let stopper = Stopper::new();
        stopper.quiesce();
        let err = stopper.run_async_task("late", async {}).unwrap_err();
        assert_eq!(
            err,
            QuiescingError {
                task: "late".into()
            }
        );
        stopper.stopped().await;
    }

    #[crate::test(tokio::test)]
    async fn closers_run_once_in_order() {
        let stopper = Stopper::new();
        let log = Arc::new(Mutex::new(vec![]));
        for i in 0..3 {
            let log = Arc::clone(&log);
            stopper.add_closer(move || log.lock().unwrap().push(i));
        }
        // Concurrent and repeated stops all complete.
        futures::join!(stopper.stop(), stopper.stop());
        stopper.stop().await;
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);

        // A closer registered after the fact runs immediately.
        let log2 = Arc::clone(&log);
        stopper.add_closer(move || log2.lock().unwrap().push(3));
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[crate::test(tokio::test)]
    async fn cancel_on_quiesce_token() {
        let stopper = Stopper::new();
        let token = stopper.with_cancel_on_quiesce();
        let unrelated = stopper.with_cancel_on_quiesce();
        unrelated.cancel();
        assert!(!stopper.is_quiescing());
        assert!(!token.is_cancelled());
        stopper.stop().await;
        assert!(token.is_cancelled());
    }

    #[crate::test(tokio::test)]
    async fn chained_stoppers() {
        let outer = Stopper::new();
        let inner = Stopper::new();
        outer
            .run_async_task("propagate", {
                let outer = outer.clone();
                let inner = inner.clone();
                async move {
                    outer.should_quiesce().await;
                    inner.stop().await;
                }
            })
            .unwrap();
        outer.stop().await;
        assert!(inner.is_stopped());
    }
}
