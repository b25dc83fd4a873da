// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.
//!
//! This module provides an API for retrying fallible asynchronous operations
//! until they succeed or until some criteria for giving up has been reached,
//! using exponential backoff between retries.
//!
//! # Examples
//!
//! Retry a contrived fallible function until it succeeds:
//!
//! ```
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! use std::time::Duration;
//! use mz_ore::retry::Retry;
//!
//! let res = Retry::default()
//!     .initial_backoff(Duration::from_millis(1))
//!     .retry_async(|state| async move {
//!         if state.i == 3 {
//!             Ok(())
//!         } else {
//!             Err("contrived failure")
//!         }
//!     })
//!     .await;
//! assert_eq!(res, Ok(()));
//! # });
//! ```
//!
//! Limit the number of retries such that success is never observed:
//!
//! ```
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! use std::time::Duration;
//! use mz_ore::retry::Retry;
//!
//! let res = Retry::default()
//!     .initial_backoff(Duration::from_millis(1))
//!     .max_tries(2)
//!     .retry_async(|state| async move {
//!         if state.i == 3 {
//!             Ok(())
//!         } else {
//!             Err("contrived failure")
//!         }
//!     })
//!     .await;
//! assert_eq!(res, Err("contrived failure"));
//! # });
//! ```

use std::cmp;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::{Instant, Sleep};

use crate::time::DurationExt;

/// The state of a retry operation constructed with [`Retry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryState {
    /// The retry counter, starting from zero on the first try.
    pub i: usize,
    /// The duration that the retry operation will sleep for before the next
    /// retry if this try fails.
    ///
    /// If this is the last attempt, then this field will be `None`.
    pub next_backoff: Option<Duration>,
}

/// Configures a retry operation.
///
/// See the [module documentation](self) for usage examples.
#[derive(Debug, Clone, PartialEq)]
pub struct Retry {
    initial_backoff: Duration,
    factor: f64,
    clamp_backoff: Duration,
    max_tries: usize,
    max_duration: Duration,
}

impl Retry {
    /// Sets the initial backoff for the retry operation.
    ///
    /// The initial backoff is the amount of time to wait if the first try
    /// fails.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Clamps the maximum backoff for the retry operation.
    ///
    /// The maximum backoff is the maximum amount of time to wait between tries.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Sets the exponential backoff factor for the retry operation.
    ///
    /// The time to wait is multiplied by this factor after each failed try. The
    /// default factor is two.
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Sets the maximum number of tries.
    ///
    /// If the operation is still failing after `max_tries`, then
    /// [`retry_async`](Retry::retry_async) will return the last error.
    ///
    /// # Panics
    ///
    /// Panics if `max_tries` is zero.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        if max_tries == 0 {
            panic!("max tries must be greater than zero");
        }
        self.max_tries = max_tries;
        self
    }

    /// Sets the maximum duration.
    ///
    /// If the operation is still failing after the specified `duration`, then
    /// the operation will be retried once more and the result of that final
    /// try will be returned.
    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = duration;
        self
    }

    /// Converts the retry policy into a [`Stream`] of [`RetryState`]s.
    ///
    /// The first state is produced immediately. Each subsequent state is
    /// produced after sleeping for the previous state's `next_backoff`. This
    /// is the building block for retry loops that need to interleave other
    /// work, like racing each try against a shutdown signal.
    pub fn into_retry_stream(self) -> RetryStream {
        RetryStream {
            start: Instant::now(),
            backoff: self.initial_backoff,
            i: 0,
            sleep: None,
            retry: self,
        }
    }

    /// Retries the asynchronous, fallible operation `f` according to the
    /// configured policy.
    ///
    /// The `retry_async` method invokes `f` repeatedly until it succeeds or
    /// until the maximum duration or tries have been reached, as configured via
    /// [`max_duration`](Retry::max_duration) or
    /// [`max_tries`](Retry::max_tries). If `f` never succeeds, then
    /// `retry_async` returns the last error.
    pub async fn retry_async<F, U, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = Result<T, E>>,
    {
        let mut stream = self.into_retry_stream();
        let mut last_err = None;
        while let Some(state) = stream.next().await {
            match f(state).await {
                Ok(t) => return Ok(t),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.expect("retry stream yields at least one state"))
    }

    /// Like [`retry_async`](Retry::retry_async), but gives up as soon as
    /// `closer` resolves.
    ///
    /// The closer is raced against both the tries themselves and the backoff
    /// sleeps between them, so an in-flight try is dropped when the closer
    /// fires. Returns [`RetryError::Closed`] carrying the error of the last
    /// completed try, if any.
    pub async fn retry_async_until<C, F, U, T, E>(
        self,
        closer: C,
        mut f: F,
    ) -> Result<T, RetryError<E>>
    where
        C: Future<Output = ()>,
        F: FnMut(RetryState) -> U,
        U: Future<Output = Result<T, E>>,
    {
        tokio::pin!(closer);
        let mut stream = self.into_retry_stream();
        let mut last_err = None;
        loop {
            let state = tokio::select! {
                biased;
                () = &mut closer => return Err(RetryError::Closed { last_err }),
                state = stream.next() => state,
            };
            let Some(state) = state else {
                let err = last_err.expect("retry stream yields at least one state");
                return Err(RetryError::Exhausted(err));
            };
            tokio::select! {
                biased;
                () = &mut closer => return Err(RetryError::Closed { last_err }),
                res = f(state) => match res {
                    Ok(t) => return Ok(t),
                    Err(e) => last_err = Some(e),
                },
            }
        }
    }
}

impl Default for Retry {
    /// Constructs a retry operation that will retry forever with backoff
    /// defaults that are reasonable for a fallible network operation.
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::MAX,
            max_tries: usize::MAX,
            max_duration: Duration::MAX,
        }
    }
}

/// The error returned by [`Retry::retry_async_until`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The closer resolved before any try succeeded.
    #[error("retry loop closed before the operation succeeded")]
    Closed {
        /// The error returned by the last completed try, if any try completed.
        last_err: Option<E>,
    },
    /// The configured tries or duration ran out.
    #[error("retries exhausted")]
    Exhausted(E),
}

/// A series of exponential, clamped sleeps, produced as [`RetryState`]s.
///
/// See [`Retry::into_retry_stream`].
#[derive(Debug)]
pub struct RetryStream {
    retry: Retry,
    start: Instant,
    // The backoff to sleep for after the next state is produced.
    backoff: Duration,
    i: usize,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl RetryStream {
    /// How many states this stream has produced so far.
    pub fn attempt(&self) -> usize {
        self.i
    }

    /// The backoff that will follow the next produced state.
    pub fn next_backoff(&self) -> Duration {
        self.backoff
    }

    fn is_last_try(&self) -> bool {
        self.i.saturating_add(1) >= self.retry.max_tries
            || self.start.elapsed().saturating_add(self.backoff) > self.retry.max_duration
    }
}

impl Stream for RetryStream {
    type Item = RetryState;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RetryState>> {
        let this = self.get_mut();
        if this.i >= this.retry.max_tries {
            return Poll::Ready(None);
        }
        if let Some(sleep) = this.sleep.as_mut() {
            ready!(sleep.as_mut().poll(cx));
            this.sleep = None;
        }
        if this.i > 0 && this.start.elapsed() >= this.retry.max_duration {
            return Poll::Ready(None);
        }

        let last = this.is_last_try();
        let state = RetryState {
            i: this.i,
            next_backoff: (!last).then_some(this.backoff),
        };
        this.i += 1;
        if last {
            // Subsequent polls report exhaustion without sleeping.
            this.retry.max_tries = this.i;
        } else {
            this.sleep = Some(Box::pin(tokio::time::sleep(this.backoff)));
            this.backoff = cmp::min(
                this.backoff.saturating_mul_f64(this.retry.factor),
                this.retry.clamp_backoff,
            );
        }
        Poll::Ready(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[crate::test(tokio::test(start_paused = true))]
    async fn retry_stream_exponential_clamped() {
        let mut stream = Retry::default()
            .initial_backoff(Duration::from_millis(50))
            .clamp_backoff(Duration::from_millis(300))
            .into_retry_stream();
        let mut backoffs = vec![];
        for _ in 0..6 {
            let state = stream.next().await.expect("stream is infinite");
            backoffs.push(state.next_backoff.expect("never the last try"));
        }
        assert_eq!(
            backoffs,
            [50, 100, 200, 300, 300, 300]
                .into_iter()
                .map(Duration::from_millis)
                .collect::<Vec<_>>()
        );
        assert_eq!(stream.attempt(), 6);
    }

    #[crate::test(tokio::test(start_paused = true))]
    async fn retry_stream_sleeps_between_states() {
        let mut stream = Retry::default()
            .initial_backoff(Duration::from_secs(1))
            .factor(1.0)
            .into_retry_stream();
        let start = Instant::now();
        stream.next().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        stream.next().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
        stream.next().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[crate::test(tokio::test(start_paused = true))]
    async fn retry_stream_max_tries() {
        let mut stream = Retry::default()
            .initial_backoff(Duration::from_millis(10))
            .max_tries(3)
            .into_retry_stream();
        let states: Vec<_> = (&mut stream).collect().await;
        assert_eq!(
            states,
            vec![
                RetryState {
                    i: 0,
                    next_backoff: Some(Duration::from_millis(10)),
                },
                RetryState {
                    i: 1,
                    next_backoff: Some(Duration::from_millis(20)),
                },
                RetryState {
                    i: 2,
                    next_backoff: None,
                },
            ]
        );
        assert_eq!(stream.next().await, None);
    }

    #[crate::test(tokio::test(start_paused = true))]
    async fn retry_async_succeeds_after_failures() {
        let tries = AtomicUsize::new(0);
        let res: Result<usize, &str> = Retry::default()
            .retry_async(|state| {
                tries.fetch_add(1, Ordering::SeqCst);
                async move {
                    if state.i < 2 {
                        Err("not yet")
                    } else {
                        Ok(state.i)
                    }
                }
            })
            .await;
        assert_eq!(res, Ok(2));
        assert_eq!(tries.load(Ordering::SeqCst), 3);
    }

    #[crate::test(tokio::test(start_paused = true))]
    async fn retry_async_until_closed_reports_last_error() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let res: Result<(), RetryError<usize>> = Retry::default()
            .initial_backoff(Duration::from_secs(1))
            .retry_async_until(
                async move {
                    let _ = rx.await;
                },
                {
                    let mut tx = Some(tx);
                    move |state| {
                        if state.i == 2 {
                            // Closing while the third try is in flight drops
                            // that try.
                            let _ = tx.take().map(|tx| tx.send(()));
                        }
                        async move { Err(state.i) }
                    }
                },
            )
            .await;
        match res {
            Err(RetryError::Closed { last_err }) => assert_eq!(last_err, Some(1)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[crate::test(tokio::test(start_paused = true))]
    async fn retry_async_until_closed_before_first_try() {
        let res: Result<(), RetryError<()>> = Retry::default()
            .retry_async_until(futures::future::ready(()), |_| async { Ok(()) })
            .await;
        assert!(matches!(res, Err(RetryError::Closed { last_err: None })));
    }

    #[crate::test(tokio::test(start_paused = true))]
    async fn retry_async_until_exhausted() {
        let res: Result<(), RetryError<&str>> = Retry::default()
            .max_tries(2)
            .retry_async_until(futures::future::pending(), |_| async { Err("nope") })
            .await;
        assert!(matches!(res, Err(RetryError::Exhausted("nope"))));
    }
}
