//! Port negotiation for the package index server.
//!
//! The negotiator tries candidate ports in ascending order. Each attempt
//! spawns the server with `--port=<N>` and watches its output:
//!
//! - ready marker: the port is bound; a stop action is registered with the
//!   [`CleanupRegistry`] and the port is returned.
//! - conflict marker plus exit: the attempt is discarded and the next port
//!   is tried.
//! - exit without either marker, or no marker within the startup window:
//!   negotiation stops with [`NegotiationResult::Fatal`].
//!
//! Only one attempt is alive at a time.

mod attempt;

use std::ops::Range;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::cleanup::CleanupRegistry;
use crate::config::NegotiatorConfig;
use crate::process::{LaunchSpec, Launcher};

use attempt::{Attempt, AttemptOutcome};

/// Why a server could not be started. Never retried.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to launch the package index server on port {port}")]
    Spawn {
        port: u16,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "package index server on port {port} exited ({}) without becoming ready; last output:\n{output}",
        describe_exit(.exit_code)
    )]
    Exited {
        port: u16,
        exit_code: Option<i32>,
        output: String,
    },

    #[error(
        "package index server on port {port} did not become ready within {timeout:?}; last output:\n{output}"
    )]
    Timeout {
        port: u16,
        timeout: Duration,
        output: String,
    },

    #[error("failed to supervise the package index server on port {port}")]
    Supervise {
        port: u16,
        #[source]
        source: anyhow::Error,
    },
}

impl StartupError {
    /// The candidate port the failing attempt used.
    pub fn port(&self) -> u16 {
        match self {
            Self::Spawn { port, .. }
            | Self::Exited { port, .. }
            | Self::Timeout { port, .. }
            | Self::Supervise { port, .. } => *port,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_owned(),
    }
}

/// Fatal negotiation outcomes, for callers that want a `Result`.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("no free port for the package index server: every port in {start}..{end} was in use")]
    Exhausted { start: u16, end: u16 },

    #[error(transparent)]
    Startup(#[from] StartupError),
}

/// Terminal outcome of [`PortNegotiator::negotiate`].
#[derive(Debug)]
pub enum NegotiationResult {
    /// The server is running on this port.
    Bound(u16),
    /// Every candidate port reported a conflict.
    Exhausted { ports: Range<u16> },
    /// The server failed for a reason other than a port conflict.
    Fatal(StartupError),
}

impl NegotiationResult {
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Bound(port) => Some(*port),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<u16, NegotiationError> {
        match self {
            Self::Bound(port) => Ok(port),
            Self::Exhausted { ports } => Err(NegotiationError::Exhausted {
                start: ports.start,
                end: ports.end,
            }),
            Self::Fatal(err) => Err(err.into()),
        }
    }
}

/// Drives the port retry loop.
pub struct PortNegotiator<'a> {
    launcher: &'a dyn Launcher,
    cleanup: &'a CleanupRegistry,
    config: NegotiatorConfig,
}

impl<'a> PortNegotiator<'a> {
    pub fn new(
        launcher: &'a dyn Launcher,
        cleanup: &'a CleanupRegistry,
        config: NegotiatorConfig,
    ) -> Self {
        Self {
            launcher,
            cleanup,
            config,
        }
    }

    /// Negotiate over the configured port range.
    pub async fn negotiate_default(&self, spec: &LaunchSpec) -> NegotiationResult {
        self.negotiate(self.config.ports.clone(), spec).await
    }

    /// Start the server on the first port in `ports` that is not in use.
    pub async fn negotiate(&self, ports: Range<u16>, spec: &LaunchSpec) -> NegotiationResult {
        let detector = self.config.detector();

        for port in ports.clone() {
            info!(port, command = %spec.display_command(port), "starting package index server");

            let spawned = match self.launcher.spawn(spec, port).await {
                Ok(spawned) => spawned,
                Err(source) => {
                    return NegotiationResult::Fatal(StartupError::Spawn { port, source });
                }
            };

            let mut attempt = Attempt::new(port, spawned);
            match attempt.watch(&detector, &self.config).await {
                AttemptOutcome::Ready => {
                    let server = attempt.into_server();
                    self.cleanup
                        .register(format!("stop package index server on port {port}"), move || {
                            server.stop()
                        });
                    info!(port, "package index server is ready");
                    return NegotiationResult::Bound(port);
                }
                AttemptOutcome::PortConflict => {
                    info!(port, "port already in use, trying the next one");
                    attempt.abandon().await;
                }
                AttemptOutcome::Failed(err) => {
                    attempt.abandon().await;
                    return NegotiationResult::Fatal(err);
                }
            }
        }

        NegotiationResult::Exhausted { ports }
    }
}
