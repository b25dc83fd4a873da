// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Server-side draining of tenant servers.

use std::time::Duration;

use tracing::{error, info};

use crate::server::OnDemandServer;

/// Drains `server` until it reports no remaining work.
///
/// Rounds that fail to reduce the remaining work cause the following rounds
/// to report verbosely. A failed round is logged and ends the drain. Rounds
/// are separated by `poll_interval`.
///
/// The drain has no deadline of its own; callers race it against whatever
/// should cut it short.
pub async fn call_drain_server_side(server: &dyn OnDemandServer, poll_interval: Duration) {
    let mut verbose = false;
    let mut prev_remaining = u64::MAX;
    loop {
        let progress = match server.graceful_drain(verbose).await {
            Ok(progress) => progress,
            Err(e) => {
                error!("graceful drain failed: {e:#}");
                return;
            }
        };
        if progress.remaining == 0 {
            info!("graceful drain complete");
            return;
        }
        info!(
            "graceful drain in progress: {} remaining ({})",
            progress.remaining, progress.info
        );
        if progress.remaining >= prev_remaining {
            verbose = true;
        }
        prev_remaining = progress.remaining;
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use crate::server::{DrainProgress, ShutdownRequest};
    use crate::tenant::{InstanceId, TenantId};

    use super::*;

    /// Replays a script of drain rounds, recording the verbosity of each.
    #[derive(Debug, Default)]
    struct ScriptedDrain {
        rounds: Mutex<VecDeque<Result<u64, String>>>,
        verbosity: Mutex<Vec<bool>>,
    }

    impl ScriptedDrain {
        fn new(rounds: Vec<Result<u64, String>>) -> ScriptedDrain {
            ScriptedDrain {
                rounds: Mutex::new(rounds.into()),
                verbosity: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl OnDemandServer for ScriptedDrain {
        async fn pre_start(&self) -> Result<(), anyhow::Error> {
            Ok(())
        }

        async fn accept_clients(&self) -> Result<(), anyhow::Error> {
            Ok(())
        }

        async fn graceful_drain(&self, verbose: bool) -> Result<DrainProgress, anyhow::Error> {
            self.verbosity.lock().unwrap().push(verbose);
            let round = self.rounds.lock().unwrap().pop_front().unwrap_or(Ok(0));
            match round {
                Ok(remaining) => Ok(DrainProgress {
                    remaining,
                    info: format!("{remaining} sessions"),
                }),
                Err(e) => Err(anyhow!(e)),
            }
        }

        async fn shutdown_requested(&self) -> ShutdownRequest {
            futures::future::pending().await
        }

        fn tenant_id(&self) -> TenantId {
            TenantId::UNSET
        }

        fn instance_id(&self) -> InstanceId {
            InstanceId(1)
        }
    }

    #[mz_ore::test(tokio::test(start_paused = true))]
    async fn drains_until_nothing_remains() {
        let server = ScriptedDrain::new(vec![Ok(5), Ok(3), Ok(3), Ok(1), Ok(0)]);
        call_drain_server_side(&server, Duration::from_millis(200)).await;
        assert_eq!(
            *server.verbosity.lock().unwrap(),
            vec![false, false, false, true, true]
        );
    }

    #[mz_ore::test(tokio::test(start_paused = true))]
    async fn failure_ends_drain() {
        let server = ScriptedDrain::new(vec![Ok(2), Err("unavailable".into()), Ok(1)]);
        call_drain_server_side(&server, Duration::from_millis(200)).await;
        assert_eq!(server.verbosity.lock().unwrap().len(), 2);
        assert_eq!(server.rounds.lock().unwrap().len(), 1);
    }

    #[mz_ore::test(tokio::test(start_paused = true))]
    async fn rounds_are_spaced() {
        let server = ScriptedDrain::new(vec![Ok(2), Ok(1), Ok(0)]);
        let start = tokio::time::Instant::now();
        call_drain_server_side(&server, Duration::from_millis(200)).await;
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }
}
