// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Structured events describing tenant server lifecycles.

use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::tenant::{InstanceId, NodeId, TenantName};

/// Details shared by all tenant service events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommonSharedServiceEventDetails {
    /// The node hosting the tenant server.
    pub node_id: NodeId,
    /// The tenant's numeric identifier, or zero if it is not yet known.
    pub tenant_id: u64,
    /// The SQL instance of the tenant server, if one was created.
    pub instance_id: InstanceId,
    /// The tenant's name.
    pub tenant_name: TenantName,
}

/// An event emitted when a tenant's shared-process service starts or stops.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TenantServiceEvent {
    /// An attempt to start the service completed.
    TenantSharedServiceStart {
        /// Common details.
        #[serde(flatten)]
        details: CommonSharedServiceEventDetails,
        /// Whether the attempt succeeded.
        ok: bool,
        /// The reason the attempt failed, if it did.
        #[serde(skip_serializing_if = "Option::is_none")]
        error_text: Option<String>,
    },
    /// A successfully started service stopped.
    TenantSharedServiceStop {
        /// Common details.
        #[serde(flatten)]
        details: CommonSharedServiceEventDetails,
    },
}

impl TenantServiceEvent {
    /// The details common to every event.
    pub fn details(&self) -> &CommonSharedServiceEventDetails {
        match self {
            TenantServiceEvent::TenantSharedServiceStart { details, .. }
            | TenantServiceEvent::TenantSharedServiceStop { details } => details,
        }
    }
}

/// A sink for node-level structured events.
///
/// Logging is fire-and-forget: implementations must not block and report
/// their own failures.
pub trait NodeEventLogger: fmt::Debug + Send + Sync {
    /// Records `event`.
    fn log_structured_event(&self, event: TenantServiceEvent);
}

/// A [`NodeEventLogger`] that writes events to the log as JSON.
#[derive(Debug, Clone, Default)]
pub struct TracingEventLogger;

impl NodeEventLogger for TracingEventLogger {
    fn log_structured_event(&self, event: TenantServiceEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "mz_tenant_controller::events", "{json}"),
            Err(e) => warn!("unable to encode tenant service event {event:?}: {e}"),
        }
    }
}
