// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Controller configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use derivative::Derivative;
use mz_ore::retry::Retry;
use mz_ore::stopper::Stopper;

use crate::event_log::NodeEventLogger;
use crate::server::{ServiceModeReader, TenantServerCreator};
use crate::tenant::{NodeId, TenantName, TenantServerArgs};

/// Command-line arguments that tune tenant orchestration.
///
/// Meant to be flattened into the hosting node's arguments.
#[derive(Debug, Clone, clap::Args)]
pub struct OrchestrationArgs {
    /// How often to compare the running tenant servers against the tenants
    /// that should be running.
    #[clap(
        long,
        env = "TENANT_WATCH_INTERVAL",
        value_parser = humantime::parse_duration,
        default_value = "1s"
    )]
    pub tenant_watch_interval: Duration,
    /// The backoff after the first failed attempt to start a tenant server.
    #[clap(
        long,
        env = "TENANT_START_INITIAL_BACKOFF",
        value_parser = humantime::parse_duration,
        default_value = "50ms"
    )]
    pub tenant_start_initial_backoff: Duration,
    /// The longest backoff between attempts to start a tenant server.
    #[clap(
        long,
        env = "TENANT_START_MAX_BACKOFF",
        value_parser = humantime::parse_duration,
        default_value = "2s"
    )]
    pub tenant_start_max_backoff: Duration,
    /// The factor by which the start backoff grows after each failure.
    #[clap(long, env = "TENANT_START_BACKOFF_MULTIPLIER", default_value = "2.0")]
    pub tenant_start_backoff_multiplier: f64,
    /// How long to wait between rounds of server-side draining.
    #[clap(
        long,
        env = "TENANT_DRAIN_POLL_INTERVAL",
        value_parser = humantime::parse_duration,
        default_value = "200ms"
    )]
    pub tenant_drain_poll_interval: Duration,
    /// The name of the tenant hosted by the node itself, which is never
    /// started or stopped by the controller.
    #[clap(long, env = "SYSTEM_TENANT_NAME", default_value = "system")]
    pub system_tenant_name: String,
}

impl Default for OrchestrationArgs {
    fn default() -> OrchestrationArgs {
        OrchestrationArgs {
            tenant_watch_interval: Duration::from_secs(1),
            tenant_start_initial_backoff: Duration::from_millis(50),
            tenant_start_max_backoff: Duration::from_secs(2),
            tenant_start_backoff_multiplier: 2.0,
            tenant_drain_poll_interval: Duration::from_millis(200),
            system_tenant_name: "system".into(),
        }
    }
}

impl OrchestrationArgs {
    /// The retry policy for starting tenant servers.
    ///
    /// Attempts are unbounded; only the control loop stopping ends them.
    pub fn start_retry(&self) -> Retry {
        Retry::default()
            .initial_backoff(self.tenant_start_initial_backoff)
            .clamp_backoff(self.tenant_start_max_backoff)
            .factor(self.tenant_start_backoff_multiplier)
    }

    /// The name of the system tenant.
    pub fn system_tenant(&self) -> TenantName {
        TenantName::new(self.system_tenant_name.as_str())
    }
}

/// Everything needed to construct a
/// [`ServerController`](crate::ServerController).
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct ServerControllerConfig {
    /// The node hosting the tenant servers.
    pub node_id: NodeId,
    /// The stopper of the hosting node. Quiescing it shuts every tenant
    /// server down without draining.
    pub stopper: Stopper,
    /// Instantiates tenant servers.
    pub creator: Arc<dyn TenantServerCreator>,
    /// Reports which tenants should be running.
    pub service_modes: Arc<dyn ServiceModeReader>,
    /// Receives lifecycle events.
    pub event_logger: Arc<dyn NodeEventLogger>,
    /// Per-tenant overrides passed to the creator.
    #[derivative(Debug = "ignore")]
    pub tenant_args: BTreeMap<TenantName, TenantServerArgs>,
    /// Tuning knobs.
    pub args: OrchestrationArgs,
}
