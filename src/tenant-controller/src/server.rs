// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The contract between the controller and the tenant servers it runs.
//!
//! The controller treats a tenant server as an opaque object that is created,
//! started in two steps, optionally drained and eventually stopped through the
//! [`Stopper`] it was created with. Everything the controller knows about
//! tenants comes through the traits in this module.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use mz_ore::stopper::Stopper;

use crate::tenant::{InstanceId, TenantId, TenantName, TenantNameContainer, TenantServerArgs};

/// A tenant server hosted in the shared process.
#[async_trait]
pub trait OnDemandServer: fmt::Debug + Send + Sync {
    /// Performs the startup steps that precede accepting clients.
    ///
    /// The future is dropped if the tenant's control loop is asked to stop
    /// while it is pending.
    async fn pre_start(&self) -> Result<(), anyhow::Error>;

    /// Begins accepting client connections.
    async fn accept_clients(&self) -> Result<(), anyhow::Error>;

    /// Performs one round of server-side draining.
    ///
    /// `verbose` requests detailed reporting, and is set once a previous round
    /// failed to make progress.
    async fn graceful_drain(&self, verbose: bool) -> Result<DrainProgress, anyhow::Error>;

    /// Resolves when the server itself asks to be shut down.
    ///
    /// Must be cancel safe: the controller races it against other shutdown
    /// sources and drops it when one of those wins.
    async fn shutdown_requested(&self) -> ShutdownRequest;

    /// The identifier of the tenant, once known.
    fn tenant_id(&self) -> TenantId;

    /// The identifier of this SQL instance.
    fn instance_id(&self) -> InstanceId;
}

/// The result of one round of [`OnDemandServer::graceful_drain`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainProgress {
    /// How much work remains to be drained.
    pub remaining: u64,
    /// A human-readable description of the remaining work.
    pub info: String,
}

/// Why a server asked to be shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A drain RPC completed and the server has nothing left to do.
    DrainRpc,
    /// The server hit an unrecoverable error.
    FatalError,
}

/// A shutdown request raised by a tenant server.
#[derive(Clone, Debug)]
pub struct ShutdownRequest {
    /// The kind of request.
    pub reason: ShutdownReason,
    /// The error behind a [`ShutdownReason::FatalError`].
    pub err: Option<Arc<anyhow::Error>>,
}

impl ShutdownRequest {
    /// A request issued after a completed drain.
    pub fn drain_rpc() -> ShutdownRequest {
        ShutdownRequest {
            reason: ShutdownReason::DrainRpc,
            err: None,
        }
    }

    /// A request issued because of a fatal error.
    pub fn fatal(err: anyhow::Error) -> ShutdownRequest {
        ShutdownRequest {
            reason: ShutdownReason::FatalError,
            err: Some(Arc::new(err)),
        }
    }

    /// Describes the cause of the request, for logging.
    pub fn shutdown_cause(&self) -> String {
        match (&self.reason, &self.err) {
            (ShutdownReason::DrainRpc, _) => "server drain process".into(),
            (ShutdownReason::FatalError, Some(err)) => format!("fatal error: {err:#}"),
            (ShutdownReason::FatalError, None) => "fatal error".into(),
        }
    }
}

/// Creates tenant servers on demand.
#[async_trait]
pub trait TenantServerCreator: fmt::Debug + Send + Sync {
    /// Instantiates a tenant server.
    ///
    /// Called once per start attempt. The server must register all of its
    /// tasks and cleanup with `stopper`, which the controller stops to shut
    /// the server down. `instance_index` is unique within the controller and
    /// increases with every call.
    async fn new_tenant_server(
        &self,
        name: TenantNameContainer,
        stopper: Stopper,
        instance_index: u64,
        args: TenantServerArgs,
    ) -> Result<Arc<dyn OnDemandServer>, anyhow::Error>;
}

/// Reports which tenants should be running on this node.
#[async_trait]
pub trait ServiceModeReader: fmt::Debug + Send + Sync {
    /// Returns the names of the tenants whose shared-process service should
    /// be running.
    async fn expected_running_tenants(&self) -> Result<Vec<TenantName>, anyhow::Error>;
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[mz_ore::test]
    fn shutdown_cause() {
        assert_eq!(
            ShutdownRequest::drain_rpc().shutdown_cause(),
            "server drain process"
        );
        assert_eq!(
            ShutdownRequest::fatal(anyhow!("disk full")).shutdown_cause(),
            "fatal error: disk full"
        );
    }
}
