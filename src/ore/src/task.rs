// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tokio task utilities.
//!
//! Every task spawned through this module carries a name. The name is
//! attached to a `task` tracing span that wraps the future, so log lines
//! emitted from inside the task can be attributed to it.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawns a new asynchronous task with a name.
///
/// The name is produced lazily by `nc`, so that callers can format names
/// without paying for it when tracing is disabled at the `debug` level.
///
/// # Panics
///
/// Panics if called outside the context of a Tokio runtime.
#[track_caller]
pub fn spawn<Fut, Name, NameClosure>(nc: NameClosure, future: Fut) -> JoinHandle<Fut::Output>
where
    Name: AsRef<str>,
    NameClosure: FnOnce() -> Name,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let span = if tracing::enabled!(tracing::Level::DEBUG) {
        let name = nc();
        tracing::debug_span!("task", name = name.as_ref())
    } else {
        tracing::Span::none()
    };
    #[allow(clippy::disallowed_methods)]
    tokio::spawn(future.instrument(span))
}
