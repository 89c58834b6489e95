//! One spawn-and-observe cycle for a single candidate port.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::NegotiatorConfig;
use crate::process::{ManagedProcess, OutputSink, ProcessStatus, Spawned};
use crate::readiness::ReadinessDetector;

use super::StartupError;

/// Bytes of server output quoted in startup errors.
const OUTPUT_TAIL_BYTES: usize = 4096;

/// How long a stopped server's output drain may take.
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How an attempt ended.
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    Ready,
    PortConflict,
    Failed(StartupError),
}

/// A live server process being watched on one candidate port.
pub(crate) struct Attempt {
    port: u16,
    process: Box<dyn ManagedProcess>,
    output: OutputSink,
    started: Instant,
}

impl Attempt {
    pub(crate) fn new(port: u16, spawned: Spawned) -> Self {
        Self {
            port,
            process: spawned.process,
            output: spawned.output,
            started: Instant::now(),
        }
    }

    /// Poll output and process status until a terminal signal.
    ///
    /// The ready marker is checked before the exit status, and once the
    /// process is seen exited its output is drained to the end before the
    /// exit is classified. Output flushed before exit therefore always
    /// counts.
    pub(crate) async fn watch(
        &mut self,
        detector: &ReadinessDetector,
        config: &NegotiatorConfig,
    ) -> AttemptOutcome {
        loop {
            self.output.drain();
            if self.output.any_stream(|text| detector.check_ready(text)) {
                return AttemptOutcome::Ready;
            }

            match self.process.poll() {
                Ok(ProcessStatus::Running) => {}
                Ok(ProcessStatus::Exited { code }) => {
                    return self.classify_exit(code, detector, config).await;
                }
                Err(source) => {
                    return AttemptOutcome::Failed(StartupError::Supervise {
                        port: self.port,
                        source,
                    });
                }
            }

            if self.started.elapsed() >= config.startup_timeout {
                return AttemptOutcome::Failed(StartupError::Timeout {
                    port: self.port,
                    timeout: config.startup_timeout,
                    output: self.output.tail(OUTPUT_TAIL_BYTES),
                });
            }

            tokio::time::sleep(config.poll_interval).await;
        }
    }

    async fn classify_exit(
        &mut self,
        code: Option<i32>,
        detector: &ReadinessDetector,
        config: &NegotiatorConfig,
    ) -> AttemptOutcome {
        if tokio::time::timeout(config.exit_drain_grace, self.output.drain_to_end())
            .await
            .is_err()
        {
            debug!(port = self.port, "server output still open after exit");
        }

        if self
            .output
            .any_stream(|text| detector.check_port_conflict(text))
        {
            return AttemptOutcome::PortConflict;
        }
        if self.output.any_stream(|text| detector.check_ready(text)) {
            warn!(port = self.port, ?code, "server exited right after reporting ready");
            return AttemptOutcome::Ready;
        }
        AttemptOutcome::Failed(StartupError::Exited {
            port: self.port,
            exit_code: code,
            output: self.output.tail(OUTPUT_TAIL_BYTES),
        })
    }

    /// Stop the process and drop its output. Failures are logged; the
    /// attempt is being discarded either way.
    pub(crate) async fn abandon(mut self) {
        if let Err(e) = self.process.stop().await {
            warn!(port = self.port, error = %format!("{e:#}"), "failed to stop abandoned server");
        }
    }

    /// Keep the process running and hand it over for later shutdown.
    pub(crate) fn into_server(self) -> RunningServer {
        RunningServer {
            port: self.port,
            process: self.process,
            drain: self.output.spawn_discard(),
        }
    }
}

/// A server that reported ready. Owned by its cleanup action.
pub(crate) struct RunningServer {
    port: u16,
    process: Box<dyn ManagedProcess>,
    /// Keeps the output channel empty so the server never blocks on a pipe.
    drain: JoinHandle<()>,
}

impl RunningServer {
    /// Terminate the server, wait for it and for its output to finish.
    pub(crate) async fn stop(mut self) -> anyhow::Result<()> {
        tracing::info!(port = self.port, "stopping package index server");
        let code = self.process.stop().await?;
        debug!(port = self.port, ?code, "package index server exited");

        if tokio::time::timeout(DRAIN_JOIN_TIMEOUT, &mut self.drain)
            .await
            .is_err()
        {
            warn!(port = self.port, "server output still open after shutdown");
            self.drain.abort();
        }
        Ok(())
    }
}
