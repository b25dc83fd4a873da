// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The control loop of a single tenant server.
//!
//! Every tenant server is driven by two tasks on the node's stopper:
//!
//!  * `propagate-close` waits for the first shutdown source to fire, records
//!    it, and stops the control loop's stopper (the ctl stopper).
//!  * `managed-tenant-server` creates and starts the tenant server, retrying
//!    until it succeeds or the ctl stopper quiesces, then waits for the
//!    server to shut down.
//!
//! Every start attempt gets a fresh tenant stopper, handed to the tenant
//! server, together with a `propagate-close-tenant` task on the ctl stopper
//! that stops the tenant stopper once the ctl stopper or the node's stopper
//! quiesces. That task is also where graceful draining happens.

use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use mz_ore::stopper::Stopper;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::drain::call_drain_server_side;
use crate::error::ControllerError;
use crate::event_log::{CommonSharedServiceEventDetails, TenantServiceEvent};
use crate::server::OnDemandServer;
use crate::state::{ServerEntry, ServerState, ShutdownSource};
use crate::tenant::{InstanceId, TenantId, TenantName, TenantNameContainer};
use crate::{ControllerState, ServerController};

impl ServerController {
    /// Starts the control loop for `name` and registers its entry.
    ///
    /// The caller must hold the registry lock and have checked that no entry
    /// for `name` exists.
    pub(crate) fn create_server_entry_locked(
        &self,
        state: &mut ControllerState,
        name: TenantName,
        ctx: &CancellationToken,
    ) -> Result<Arc<ServerEntry>, ControllerError> {
        if self.is_draining() {
            return Err(ControllerError::Draining);
        }
        let entry = self.start_controlled_server(name.clone(), ctx.clone())?;
        state.servers.insert(name, Arc::clone(&entry));
        Ok(entry)
    }

    /// Spawns the tasks that start, run and eventually stop the tenant
    /// server for `name`.
    ///
    /// Canceling `ctx` stops the tenant server.
    fn start_controlled_server(
        &self,
        name: TenantName,
        ctx: CancellationToken,
    ) -> Result<Arc<ServerEntry>, ControllerError> {
        let entry = Arc::new(ServerEntry::new(TenantNameContainer::new(name.clone())));
        let span = info_span!("tenant-orchestration", tenant = %name);

        // Owns the propagate-close-tenant tasks of every start attempt.
        // Separate from the tenant stopper so that failed attempts can be
        // retried.
        let ctl_stopper = Stopper::new();

        let propagate_close = self
            .clone()
            .propagate_close(
                Arc::clone(&entry.state),
                ctl_stopper.clone(),
                ctx,
                name.clone(),
            )
            .instrument(span.clone());
        if let Err(e) = self
            .inner
            .stopper
            .run_async_task("propagate-close", propagate_close)
        {
            // Nobody else will stop the ctl stopper.
            ctl_stopper.quiesce();
            return Err(e.into());
        }

        let managed = self
            .clone()
            .run_managed_server(Arc::clone(&entry), ctl_stopper, name)
            .instrument(span);
        if let Err(e) = self
            .inner
            .stopper
            .run_async_task("managed-tenant-server", managed)
        {
            // Let propagate-close wind down the ctl stopper.
            entry.state.request_stop();
            return Err(e.into());
        }

        Ok(entry)
    }

    /// Waits for the first shutdown source and stops the ctl stopper.
    async fn propagate_close(
        self,
        state: Arc<ServerState>,
        ctl_stopper: Stopper,
        ctx: CancellationToken,
        name: TenantName,
    ) {
        let outer = &self.inner.stopper;
        let source = tokio::select! {
            biased;
            () = outer.should_quiesce() => Some(ShutdownSource::OuterQuiesce),
            // The control loop's cleanup requests a stop of its own once it
            // is done, which is not a shutdown source.
            () = state.stop_requested() => {
                (!state.is_exiting()).then_some(ShutdownSource::StopRequested)
            }
            () = ctx.cancelled() => Some(ShutdownSource::ContextCanceled),
        };
        match source {
            None => info!("tenant {name} terminating"),
            Some(source) => {
                let source = state.offer_shutdown_source(source);
                match source {
                    ShutdownSource::ServerRequested => {
                        info!("tenant {name} requested its own shutdown; telling it to terminate")
                    }
                    ShutdownSource::StopRequested => {
                        info!("received request for tenant {name} to terminate")
                    }
                    ShutdownSource::OuterQuiesce => {
                        info!("server terminating; telling tenant {name} to terminate")
                    }
                    ShutdownSource::ContextCanceled => {
                        info!("startup context canceled; telling tenant {name} to terminate")
                    }
                }
            }
        }
        ctl_stopper.stop().await;
    }

    /// Drives the tenant server for `name` from creation to shutdown.
    async fn run_managed_server(
        self,
        entry: Arc<ServerEntry>,
        ctl_stopper: Stopper,
        name: TenantName,
    ) {
        let _cleanup = scopeguard::guard((), |()| {
            // Covers exits that no shutdown source caused, so that
            // propagate-close also terminates.
            entry.state.mark_stopping();
            entry.state.request_stop();
            let mut state = self.inner.state.lock().expect("lock poisoned");
            entry.state.mark_stopped();
            if state
                .servers
                .get(&name)
                .is_some_and(|e| Arc::ptr_eq(e, &entry))
            {
                state.servers.remove(&name);
            }
        });

        let Some((server, tenant_stopper)) = self.start_with_retries(&entry, &ctl_stopper).await
        else {
            debug!("tenant {name} abandoned startup");
            return;
        };

        let details = self.event_details(server.tenant_id(), server.instance_id(), &name);
        self.inner
            .event_logger
            .log_structured_event(TenantServiceEvent::TenantSharedServiceStart {
                details: details.clone(),
                ok: true,
                error_text: None,
            });
        tenant_stopper.add_closer({
            let event_logger = Arc::clone(&self.inner.event_logger);
            move || {
                event_logger.log_structured_event(TenantServiceEvent::TenantSharedServiceStop {
                    details,
                })
            }
        });

        let published = entry.publish_server(Arc::clone(&server));
        debug_assert!(published, "tenant {name} server published twice");
        entry.state.mark_started();
        info!("tenant {name} started");

        tokio::select! {
            () = tenant_stopper.should_quiesce() => {
                info!("tenant {name} finishing their own control loop");
            }
            request = server.shutdown_requested() => {
                info!(
                    "tenant {name} requesting their own shutdown: {}",
                    request.shutdown_cause()
                );
                entry.state.offer_shutdown_source(ShutdownSource::ServerRequested);
                entry.state.request_stop();
            }
        }
        tenant_stopper.stopped().await;
        info!("tenant {name} stopped");
    }

    /// Creates and starts a tenant server, retrying until an attempt succeeds
    /// or the ctl stopper quiesces.
    ///
    /// Returns the live server and its stopper, or `None` if startup was
    /// abandoned.
    async fn start_with_retries(
        &self,
        entry: &Arc<ServerEntry>,
        ctl_stopper: &Stopper,
    ) -> Option<(Arc<dyn OnDemandServer>, Stopper)> {
        let mut retries = self.inner.args.start_retry().into_retry_stream();
        loop {
            let retry = tokio::select! {
                biased;
                () = ctl_stopper.should_quiesce() => return None,
                retry = retries.next() => retry?,
            };

            let tenant_stopper = Stopper::new();
            let propagate = self.clone().propagate_close_tenant(
                Arc::clone(entry),
                ctl_stopper.clone(),
                tenant_stopper.clone(),
            );
            let propagate = propagate.instrument(Span::current());
            if let Err(e) = ctl_stopper.run_async_task("propagate-close-tenant", propagate) {
                debug!("{e}");
                tenant_stopper.stop().await;
                return None;
            }

            let res = tokio::select! {
                biased;
                () = ctl_stopper.should_quiesce() => {
                    tenant_stopper.stop().await;
                    return None;
                }
                res = self.create_and_start(&entry.name, tenant_stopper.clone()) => res,
            };
            match res {
                Ok(server) => return Some((server, tenant_stopper)),
                Err(e) => {
                    // Also ends the propagate-close-tenant task of this attempt.
                    tenant_stopper.stop().await;
                    let name = entry.name.get();
                    self.inner.event_logger.log_structured_event(
                        TenantServiceEvent::TenantSharedServiceStart {
                            details: self.event_details(TenantId::UNSET, InstanceId(0), &name),
                            ok: false,
                            error_text: Some(format!("{e:#}")),
                        },
                    );
                    warn!(
                        "unable to start server for tenant {name} (attempt {}, will retry): {e:#}",
                        retry.i + 1
                    );
                    entry
                        .state
                        .record_start_error(ControllerError::start_failed(e));
                }
            }
        }
    }

    async fn create_and_start(
        &self,
        name: &TenantNameContainer,
        tenant_stopper: Stopper,
    ) -> Result<Arc<dyn OnDemandServer>, anyhow::Error> {
        let server = self
            .new_server_internal(name, tenant_stopper)
            .await
            .context("while creating server")?;
        async {
            info!("starting tenant server");
            server.pre_start().await.context("while starting server")?;
            server
                .accept_clients()
                .await
                .context("while accepting clients")
        }
        .instrument(info_span!("start-server"))
        .await?;
        Ok(server)
    }

    async fn new_server_internal(
        &self,
        name: &TenantNameContainer,
        tenant_stopper: Stopper,
    ) -> Result<Arc<dyn OnDemandServer>, anyhow::Error> {
        let tenant_args = self
            .inner
            .tenant_args
            .get(&name.get())
            .cloned()
            .unwrap_or_default();
        let idx = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            state.next_server_idx += 1;
            state.next_server_idx
        };
        self.inner
            .creator
            .new_tenant_server(name.clone(), tenant_stopper, idx, tenant_args)
            .await
    }

    /// Stops the tenant stopper of one start attempt once the ctl stopper or
    /// the node's stopper quiesces, draining the tenant server first if the
    /// shutdown was explicitly requested.
    async fn propagate_close_tenant(
        self,
        entry: Arc<ServerEntry>,
        ctl_stopper: Stopper,
        tenant_stopper: Stopper,
    ) {
        let outer = &self.inner.stopper;
        tokio::select! {
            biased;
            () = tenant_stopper.should_quiesce() => {
                // The tenant server is shutting down on its own.
            }
            () = outer.should_quiesce() => {
                // Expedited shutdown of the node.
                tenant_stopper.stop().await;
            }
            () = ctl_stopper.should_quiesce() => {
                let graceful = entry
                    .state
                    .shutdown_source()
                    .is_some_and(|source| source.wants_graceful_drain());
                // Once the node quiesces it can no longer serve the tenant
                // server's requests, so draining could not complete.
                if graceful && !outer.is_quiescing() {
                    if let Some(server) = entry.server() {
                        info!("starting graceful drain");
                        let poll_interval = self.inner.args.tenant_drain_poll_interval;
                        tokio::select! {
                            biased;
                            () = outer.should_quiesce() => {
                                info!("graceful drain interrupted by server shutdown");
                            }
                            () = call_drain_server_side(&*server, poll_interval) => {}
                        }
                    }
                }
                tenant_stopper.stop().await;
            }
        }
    }

    fn event_details(
        &self,
        tenant_id: TenantId,
        instance_id: InstanceId,
        name: &TenantName,
    ) -> CommonSharedServiceEventDetails {
        CommonSharedServiceEventDetails {
            node_id: self.inner.node_id,
            tenant_id: tenant_id.to_u64(),
            instance_id,
            tenant_name: name.clone(),
        }
    }
}
