// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Orchestration of tenant servers hosted in a shared process.
//!
//! A node can host a server for every tenant whose service mode says it
//! should be running in the node's process. The [`ServerController`] keeps
//! track of these servers: it starts them on demand or when reconciliation
//! finds they should be running, retries their startup on failure, and shuts
//! them down when they are no longer wanted or when the node shuts down.
//!
//! Each tenant server is driven by its own control loop, which moves it
//! through startup (with retries), running and shutdown. Shutdown can be
//! requested by four sources: the tenant server itself, an explicit
//! [`ServerState::request_stop`] call, the node's [`Stopper`] quiescing, or
//! cancellation of the context the control loop was spawned with. Only an
//! explicit stop request drains the server gracefully before stopping it.
//!
//! [`Stopper`]: mz_ore::stopper::Stopper

#![deny(missing_docs)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use derivative::Derivative;
use mz_ore::stopper::Stopper;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::event_log::NodeEventLogger;
use crate::server::{OnDemandServer, ServiceModeReader, TenantServerCreator};
use crate::state::ServerEntry;
use crate::tenant::{NodeId, TenantName, TenantServerArgs};

pub mod config;
pub mod drain;
pub mod error;
pub mod event_log;
pub mod server;
pub mod state;
pub mod tenant;

mod orchestration;
mod reconcile;

pub use crate::config::{OrchestrationArgs, ServerControllerConfig};
pub use crate::error::ControllerError;
pub use crate::state::{ServerState, ShutdownSource};

/// Starts, monitors and stops the tenant servers of a node.
///
/// Cheaply cloneable; all clones share the same registry of tenant servers.
#[derive(Debug, Clone)]
pub struct ServerController {
    inner: Arc<Inner>,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct Inner {
    node_id: NodeId,
    /// The stopper of the hosting node.
    stopper: Stopper,
    creator: Arc<dyn TenantServerCreator>,
    service_modes: Arc<dyn ServiceModeReader>,
    event_logger: Arc<dyn NodeEventLogger>,
    #[derivative(Debug = "ignore")]
    tenant_args: BTreeMap<TenantName, TenantServerArgs>,
    args: OrchestrationArgs,
    /// Set once the node begins draining. Never unset.
    draining: AtomicBool,
    state: Mutex<ControllerState>,
}

/// The registry of tenant servers.
///
/// An entry is present exactly while its control loop runs. Entries are only
/// ever removed by their own control loop.
#[derive(Debug, Default)]
struct ControllerState {
    servers: BTreeMap<TenantName, Arc<ServerEntry>>,
    /// The index of the most recently created tenant server instance.
    next_server_idx: u64,
}

impl ServerController {
    /// Creates a controller with no running tenant servers.
    ///
    /// Nothing is started until [`ServerController::start`] or
    /// [`ServerController::ensure_running`] is called.
    pub fn new(config: ServerControllerConfig) -> ServerController {
        let ServerControllerConfig {
            node_id,
            stopper,
            creator,
            service_modes,
            event_logger,
            tenant_args,
            args,
        } = config;
        ServerController {
            inner: Arc::new(Inner {
                node_id,
                stopper,
                creator,
                service_modes,
                event_logger,
                tenant_args,
                args,
                draining: AtomicBool::new(false),
                state: Mutex::new(ControllerState::default()),
            }),
        }
    }

    /// Returns the live server for `name`, starting one if necessary.
    ///
    /// Waits until the start succeeds or is abandoned, the node begins
    /// quiescing, or `ctx` is canceled. A control loop started by this call
    /// also stops when `ctx` is canceled.
    pub async fn ensure_running(
        &self,
        name: &TenantName,
        ctx: &CancellationToken,
    ) -> Result<Arc<dyn OnDemandServer>, ControllerError> {
        let entry = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            let existing = state.servers.get(name).cloned();
            match existing {
                Some(entry) => entry,
                None => self.create_server_entry_locked(&mut state, name.clone(), ctx)?,
            }
        };

        tokio::select! {
            biased;
            res = entry.state.wait_started_or_stopped() => {
                res?;
                entry.server().ok_or(ControllerError::StoppedBeforeStart)
            }
            () = self.inner.stopper.should_quiesce() => Err(ControllerError::Stopping),
            () = ctx.cancelled() => Err(ControllerError::Canceled),
        }
    }

    /// Stops every tenant server and waits until all of them have stopped.
    ///
    /// Tenant servers are stopped gracefully, unless the node is quiescing.
    pub async fn close(&self) {
        for entry in self.request_stop_all() {
            entry.state.wait_stopped().await;
        }
    }

    /// Marks the node as draining and requests every tenant server to stop.
    ///
    /// Returns immediately with the number of tenant servers that have not
    /// stopped yet. Meant to be called repeatedly until it returns zero.
    pub fn drain(&self) -> usize {
        self.set_draining();
        let mut still_running = 0;
        for entry in self.request_stop_all() {
            if !entry.state.is_stopped() {
                info!("server for tenant {} still running", entry.name);
                still_running += 1;
            }
        }
        still_running
    }

    /// Marks the node as draining: no new tenant servers will be started
    /// and reconciliation ends.
    pub fn set_draining(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
    }

    /// Reports whether the node is draining.
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Returns the lifecycle handle of the tenant server for `name`, if its
    /// control loop is running.
    pub fn server_state(&self, name: &TenantName) -> Option<Arc<ServerState>> {
        let state = self.inner.state.lock().expect("lock poisoned");
        state
            .servers
            .get(name)
            .map(|entry| Arc::clone(&entry.state))
    }

    /// Returns the names of the tenants whose control loops are running.
    pub fn tenant_names(&self) -> Vec<TenantName> {
        let state = self.inner.state.lock().expect("lock poisoned");
        state.servers.keys().cloned().collect()
    }

    /// Requests every tenant server to stop and returns the entries to which
    /// the request was sent.
    fn request_stop_all(&self) -> Vec<Arc<ServerEntry>> {
        let entries: Vec<_> = {
            let state = self.inner.state.lock().expect("lock poisoned");
            state.servers.values().cloned().collect()
        };
        for entry in &entries {
            entry.state.request_stop();
        }
        entries
    }
}
