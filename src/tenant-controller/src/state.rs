// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Lifecycle handles of tenant servers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::ControllerError;
use crate::server::OnDemandServer;
use crate::tenant::TenantNameContainer;

/// Why a tenant server's control loop began shutting down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownSource {
    /// The tenant server asked to be shut down.
    ServerRequested,
    /// [`ServerState::request_stop`] was called.
    StopRequested,
    /// The hosting node began quiescing.
    OuterQuiesce,
    /// The context the control loop was spawned with was canceled.
    ContextCanceled,
}

impl ShutdownSource {
    /// Whether the tenant server should be drained before it is stopped.
    pub fn wants_graceful_drain(&self) -> bool {
        matches!(self, ShutdownSource::StopRequested)
    }
}

/// The lifecycle of one attempt to run a tenant server.
///
/// A handle is created together with its control loop and resolves twice:
/// once when the start either succeeds or is abandoned, and once more when
/// the control loop has fully exited. The first resolution always precedes
/// the second.
#[derive(Debug, Default)]
pub struct ServerState {
    started_or_stopped: CancellationToken,
    start_err: Mutex<Option<ControllerError>>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    stop_request: CancellationToken,
    /// Set once the control loop has begun its final cleanup.
    exiting: AtomicBool,
    stopped: CancellationToken,
    shutdown_source: OnceLock<ShutdownSource>,
}

impl ServerState {
    pub(crate) fn new() -> ServerState {
        ServerState::default()
    }

    /// Asks the control loop to stop the tenant server.
    ///
    /// Only the first call has an effect. Safe to call concurrently.
    pub fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            self.stop_request.cancel();
        }
    }

    /// Reports whether [`ServerState::request_stop`] has been called.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Waits until the start either succeeds or is abandoned.
    ///
    /// Returns whether the server is live, or the error that ended the start.
    pub async fn wait_started_or_stopped(&self) -> Result<bool, ControllerError> {
        self.started_or_stopped.cancelled().await;
        match &*self.start_err.lock().expect("lock poisoned") {
            Some(err) => Err(err.clone()),
            None => Ok(self.is_started()),
        }
    }

    /// Waits until the control loop has exited and the tenant server has
    /// been removed from the controller.
    pub async fn wait_stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Reports whether the tenant server is live.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Reports whether the start has resolved.
    pub fn is_started_or_stopped(&self) -> bool {
        self.started_or_stopped.is_cancelled()
    }

    /// Reports whether the control loop has exited.
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// The error of the latest failed start attempt, if any.
    pub fn start_err(&self) -> Option<ControllerError> {
        self.start_err.lock().expect("lock poisoned").clone()
    }

    /// The source that shut the control loop down, once one has.
    pub fn shutdown_source(&self) -> Option<ShutdownSource> {
        self.shutdown_source.get().copied()
    }

    pub(crate) async fn stop_requested(&self) {
        self.stop_request.cancelled().await
    }

    /// Records `source` unless another source was recorded first. Returns
    /// the recorded source.
    pub(crate) fn offer_shutdown_source(&self, source: ShutdownSource) -> ShutdownSource {
        *self.shutdown_source.get_or_init(|| source)
    }

    /// Reports whether the control loop has finished driving the server and
    /// is cleaning up.
    pub(crate) fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    pub(crate) fn record_start_error(&self, err: ControllerError) {
        *self.start_err.lock().expect("lock poisoned") = Some(err);
    }

    pub(crate) fn mark_started(&self) {
        *self.start_err.lock().expect("lock poisoned") = None;
        self.started.store(true, Ordering::SeqCst);
        self.started_or_stopped.cancel();
    }

    /// Marks the server as no longer live and, if the start has not resolved
    /// yet, resolves it as abandoned. An abandoned start reports
    /// [`ControllerError::StoppedBeforeStart`] in place of the error of its
    /// latest attempt.
    pub(crate) fn mark_stopping(&self) {
        self.exiting.store(true, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        if !self.started_or_stopped.is_cancelled() {
            *self.start_err.lock().expect("lock poisoned") =
                Some(ControllerError::StoppedBeforeStart);
            self.started_or_stopped.cancel();
        }
    }

    /// Must be preceded by [`ServerState::mark_stopping`].
    pub(crate) fn mark_stopped(&self) {
        self.stopped.cancel();
    }
}

/// A tenant server's entry in the controller.
#[derive(Debug)]
pub(crate) struct ServerEntry {
    pub name: TenantNameContainer,
    pub state: Arc<ServerState>,
    pub server: OnceLock<Arc<dyn OnDemandServer>>,
}

impl ServerEntry {
    pub fn new(name: TenantNameContainer) -> ServerEntry {
        ServerEntry {
            name,
            state: Arc::new(ServerState::new()),
            server: OnceLock::new(),
        }
    }

    pub fn server(&self) -> Option<Arc<dyn OnDemandServer>> {
        self.server.get().map(Arc::clone)
    }

    /// Publishes the live server. Returns false, keeping the server already
    /// published, if one was.
    pub fn publish_server(&self, server: Arc<dyn OnDemandServer>) -> bool {
        self.server.set(server).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use crate::server::{DrainProgress, ShutdownRequest};
    use crate::tenant::{InstanceId, TenantId};

    use super::*;

    #[derive(Debug)]
    struct IdleServer(i32);

    #[async_trait]
    impl OnDemandServer for IdleServer {
        async fn pre_start(&self) -> Result<(), anyhow::Error> {
            Ok(())
        }

        async fn accept_clients(&self) -> Result<(), anyhow::Error> {
            Ok(())
        }

        async fn graceful_drain(&self, _verbose: bool) -> Result<DrainProgress, anyhow::Error> {
            Ok(DrainProgress::default())
        }

        async fn shutdown_requested(&self) -> ShutdownRequest {
            futures::future::pending().await
        }

        fn tenant_id(&self) -> TenantId {
            TenantId::UNSET
        }

        fn instance_id(&self) -> InstanceId {
            InstanceId(self.0)
        }
    }

    #[mz_ore::test]
    fn server_is_published_once() {
        let entry = ServerEntry::new(TenantNameContainer::new("app".into()));
        assert!(entry.server().is_none());
        assert!(entry.publish_server(Arc::new(IdleServer(1))));
        assert!(!entry.publish_server(Arc::new(IdleServer(2))));
        assert_eq!(entry.server().unwrap().instance_id(), InstanceId(1));
    }

    #[mz_ore::test]
    fn exiting_is_set_by_mark_stopping() {
        let state = ServerState::new();
        state.request_stop();
        assert!(!state.is_exiting());
        state.mark_stopping();
        assert!(state.is_exiting());
    }

    #[mz_ore::test(tokio::test)]
    async fn request_stop_is_idempotent() {
        let state = Arc::new(ServerState::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                mz_ore::task::spawn(|| "request-stop", async move { state.request_stop() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(state.is_stop_requested());
        mz_ore::test::timeout(Duration::from_secs(5), state.stop_requested()).await;
    }

    #[mz_ore::test(tokio::test)]
    async fn started_then_stopped() {
        let state = ServerState::new();
        state.record_start_error(ControllerError::start_failed(anyhow!("transient")));
        assert!(!state.is_started_or_stopped());
        state.mark_started();
        assert!(state.wait_started_or_stopped().await.unwrap());
        assert!(state.start_err().is_none());

        state.mark_stopping();
        state.mark_stopped();
        state.wait_stopped().await;
        assert!(!state.is_started());
        // A resolved start stays resolved without an error.
        assert!(!state.wait_started_or_stopped().await.unwrap());
    }

    #[mz_ore::test(tokio::test)]
    async fn abandoned_start_after_failures() {
        let state = ServerState::new();
        state.record_start_error(ControllerError::start_failed(anyhow!("no disk")));
        assert_eq!(state.start_err().unwrap().to_string(), "no disk");
        state.mark_stopping();
        assert!(matches!(
            state.wait_started_or_stopped().await,
            Err(ControllerError::StoppedBeforeStart)
        ));
    }

    #[mz_ore::test(tokio::test)]
    async fn abandoned_start_without_attempts() {
        let state = ServerState::new();
        state.mark_stopping();
        state.mark_stopped();
        assert!(matches!(
            state.wait_started_or_stopped().await,
            Err(ControllerError::StoppedBeforeStart)
        ));
    }

    #[mz_ore::test]
    fn first_shutdown_source_wins() {
        let state = ServerState::new();
        assert_eq!(state.shutdown_source(), None);
        assert_eq!(
            state.offer_shutdown_source(ShutdownSource::ServerRequested),
            ShutdownSource::ServerRequested
        );
        assert_eq!(
            state.offer_shutdown_source(ShutdownSource::StopRequested),
            ShutdownSource::ServerRequested
        );
        assert!(!state.shutdown_source().unwrap().wants_graceful_drain());
        assert!(ShutdownSource::StopRequested.wants_graceful_drain());
    }
}
