// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors reported by the tenant controller.

use std::sync::Arc;

use mz_ore::stopper::QuiescingError;

/// An error reported by the [`ServerController`](crate::ServerController).
///
/// Errors are cheaply cloneable, so that the error that ended a tenant's
/// startup can be handed to every caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControllerError {
    /// The node is draining and no new tenant servers may be started.
    #[error("server is draining")]
    Draining,
    /// The outer node is shutting down.
    #[error("server stopping")]
    Stopping,
    /// The tenant server was stopped before it finished starting.
    #[error("server stop before successful start")]
    StoppedBeforeStart,
    /// The caller's context was canceled while waiting.
    #[error("context canceled")]
    Canceled,
    /// The most recent attempt to start the tenant server failed.
    #[error("{0:#}")]
    StartFailed(Arc<anyhow::Error>),
    /// The set of tenants that should be running could not be determined.
    #[error("listing tenants: {0:#}")]
    ListTenants(Arc<anyhow::Error>),
    /// A control task could not be spawned.
    #[error(transparent)]
    Task(#[from] QuiescingError),
}

impl ControllerError {
    /// Wraps a start failure.
    pub fn start_failed(err: anyhow::Error) -> ControllerError {
        ControllerError::StartFailed(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[mz_ore::test]
    fn display() {
        let err = ControllerError::start_failed(anyhow!("boom").context("while starting server"));
        assert_eq!(err.to_string(), "while starting server: boom");
        assert_eq!(ControllerError::Stopping.to_string(), "server stopping");
        assert_eq!(
            ControllerError::StoppedBeforeStart.to_string(),
            "server stop before successful start"
        );
        let err = ControllerError::from(QuiescingError {
            task: "propagate-close".into(),
        });
        assert_eq!(
            err.to_string(),
            "cannot start task \"propagate-close\": stopper is quiescing"
        );
    }
}
