// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tracing utilities.
//!
//! This module contains application tracing utilities built on top of the
//! [`tracing`] library. The key export is the **[`configure`]** function,
//! which configures the `tracing` crate with sensible defaults and should be
//! called during initialization of every binary that hosts a tenant
//! controller.

use std::io::{self, IsTerminal};

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::format::{format, Writer};
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Application tracing configuration.
///
/// See the [`configure`] function for details.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Configuration of the stderr log.
    pub stderr_log: StderrLogConfig,
}

/// Configures the stderr log.
#[derive(Debug, Clone)]
pub struct StderrLogConfig {
    /// An optional prefix for each stderr log line.
    pub prefix: Option<String>,
    /// A filter which determines which events are emitted to the log.
    pub filter: Targets,
    /// Whether to route output through the test harness's capture, so that
    /// the logs of passing tests are hidden.
    pub capture_for_tests: bool,
}

/// Enables application tracing via the [`tracing`] library.
///
/// The `tracing` library is configured to emit events as textual log lines to
/// stderr. [`StderrLogConfig`] offers a small degree of control over this
/// behavior. ANSI colors are used only when stderr is a terminal.
///
/// Returns an error if a global subscriber has already been installed.
pub fn configure(service_name: &str, config: TracingConfig) -> Result<(), anyhow::Error> {
    let StderrLogConfig {
        prefix,
        filter,
        capture_for_tests,
    } = config.stderr_log;
    let layer = fmt::layer().event_format(PrefixFormat {
        inner: format(),
        prefix,
    });
    let layer = if capture_for_tests {
        layer
            .with_test_writer()
            .with_ansi(false)
            .with_filter(filter)
            .boxed()
    } else {
        layer
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_filter(filter)
            .boxed()
    };
    tracing_subscriber::registry().with(layer).try_init()?;
    tracing::debug!("configured tracing for {service_name}");
    Ok(())
}

/// Returns the level of a specific target from a [`Targets`].
pub fn target_level(targets: &Targets, target: &str) -> Level {
    if targets.would_enable(target, &Level::TRACE) {
        Level::TRACE
    } else if targets.would_enable(target, &Level::DEBUG) {
        Level::DEBUG
    } else if targets.would_enable(target, &Level::INFO) {
        Level::INFO
    } else if targets.would_enable(target, &Level::WARN) {
        Level::WARN
    } else {
        Level::ERROR
    }
}

/// A wrapper around a [`FormatEvent`] that adds an optional prefix to each
/// event.
#[derive(Debug)]
pub struct PrefixFormat<F> {
    inner: F,
    prefix: Option<String>,
}

impl<F, C, N> FormatEvent<C, N> for PrefixFormat<F>
where
    C: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    F: FormatEvent<C, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, C, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if let Some(prefix) = &self.prefix {
            if writer.has_ansi_escapes() {
                write!(writer, "\x1b[1m{prefix}:\x1b[0m ")?;
            } else {
                write!(writer, "{prefix}: ")?;
            }
        }
        self.inner.format_event(ctx, writer, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[crate::test]
    fn target_level_resolution() {
        let targets: Targets = "info,mz_tenant_controller=debug,noisy=warn"
            .parse()
            .unwrap();
        assert_eq!(target_level(&targets, "mz_tenant_controller"), Level::DEBUG);
        assert_eq!(
            target_level(&targets, "mz_tenant_controller::orchestration"),
            Level::DEBUG
        );
        assert_eq!(target_level(&targets, "noisy"), Level::WARN);
        assert_eq!(target_level(&targets, "anything_else"), Level::INFO);
    }

    #[crate::test]
    fn configure_twice_fails() {
        // `#[crate::test]` has already installed the test subscriber.
        let res = configure(
            "test",
            TracingConfig {
                stderr_log: StderrLogConfig {
                    prefix: Some("test".into()),
                    filter: Targets::new(),
                    capture_for_tests: true,
                },
            },
        );
        assert!(res.is_err());
    }
}
