// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Reconciliation of running tenant servers against their service modes.

use std::collections::BTreeSet;
use std::sync::Arc;

use mz_ore::retry::RetryError;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ControllerError;
use crate::tenant::TenantName;
use crate::ServerController;

impl ServerController {
    /// Starts the tenant servers that should be running, then keeps watching
    /// for tenants whose service mode changes.
    ///
    /// The initial round runs before this method returns, so that tenants
    /// that are already expected to run get a chance to start before the node
    /// reports readiness. Fails with the first tenant that cannot be started.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<(), ControllerError> {
        self.start_initial_secondary_tenant_servers(ctx).await?;

        let watch_ctx = ctx.child_token();
        let this = self.clone();
        self.inner
            .stopper
            .run_async_task("mark-tenant-services", async move {
                this.watch_tenant_services(watch_ctx).await
            })?;
        Ok(())
    }

    async fn start_initial_secondary_tenant_servers(
        &self,
        ctx: &CancellationToken,
    ) -> Result<(), ControllerError> {
        let closer = async {
            tokio::select! {
                () = self.inner.stopper.should_quiesce() => {}
                () = ctx.cancelled() => {}
            }
        };
        let res = self
            .inner
            .args
            .start_retry()
            .retry_async_until(closer, |state| async move {
                let res = self.inner.service_modes.expected_running_tenants().await;
                if let Err(e) = &res {
                    warn!(
                        "unable to get expected running tenants (attempt {}): {e:#}",
                        state.i + 1
                    );
                }
                res
            })
            .await;
        let tenants = match res {
            Ok(tenants) => tenants,
            Err(RetryError::Closed { .. }) if ctx.is_cancelled() => {
                return Err(ControllerError::Canceled)
            }
            Err(RetryError::Closed { .. }) => return Err(ControllerError::Stopping),
            Err(RetryError::Exhausted(e)) => return Err(ControllerError::ListTenants(Arc::new(e))),
        };

        let system_tenant = self.inner.args.system_tenant();
        for name in tenants {
            if name == system_tenant {
                continue;
            }
            self.ensure_running(&name, ctx).await?;
        }
        Ok(())
    }

    /// Periodically reconciles until the node quiesces or begins draining.
    ///
    /// `ctx` is the spawn context of every control loop this task starts and
    /// is canceled when the task exits.
    async fn watch_tenant_services(self, ctx: CancellationToken) {
        let _guard = ctx.clone().drop_guard();
        let period = self.inner.args.tenant_watch_interval;
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = self.inner.stopper.should_quiesce() => return,
                () = ctx.cancelled() => return,
            }
            if self.is_draining() {
                info!("server draining; no longer watching tenant services");
                return;
            }
            if let Err(e) = self.scan_tenants_for_runnable_services(&ctx).await {
                warn!("cannot update running tenant services: {e}");
            }
        }
    }

    /// Performs one round of reconciliation.
    ///
    /// Requests the tenant servers whose tenants should no longer run to stop,
    /// and starts control loops, spawned with `ctx`, for tenants that should
    /// run but have none. The system tenant is ignored.
    pub async fn scan_tenants_for_runnable_services(
        &self,
        ctx: &CancellationToken,
    ) -> Result<(), ControllerError> {
        let requested = self
            .inner
            .service_modes
            .expected_running_tenants()
            .await
            .map_err(|e| ControllerError::ListTenants(Arc::new(e)))?;
        let system_tenant = self.inner.args.system_tenant();
        let requested: BTreeSet<TenantName> = requested
            .into_iter()
            .filter(|name| *name != system_tenant)
            .collect();
        self.reconcile(&requested, ctx)
    }

    fn reconcile(
        &self,
        requested: &BTreeSet<TenantName>,
        ctx: &CancellationToken,
    ) -> Result<(), ControllerError> {
        // Held for the whole pass, so that no control loop is created or
        // removed in between.
        let mut state = self.inner.state.lock().expect("lock poisoned");

        for (name, entry) in &state.servers {
            if !requested.contains(name) {
                info!("tenant {name} has changed service mode, should now stop");
                entry.state.request_stop();
            }
        }

        for name in requested {
            if !state.servers.contains_key(name) {
                info!("tenant {name} has changed service mode, should now start");
                self.create_server_entry_locked(&mut state, name.clone(), ctx)?;
            }
        }
        Ok(())
    }
}
