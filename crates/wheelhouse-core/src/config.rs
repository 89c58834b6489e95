use std::ops::Range;
use std::time::Duration;

use thiserror::Error;

use crate::process::local::DEFAULT_STOP_TIMEOUT;
use crate::readiness::{CONFLICT_MARKER, READY_MARKER, ReadinessDetector};

/// Errors from an inconsistent [`NegotiatorConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port range {start}..{end} is empty")]
    EmptyPortRange { start: u16, end: u16 },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("{0} marker must not be empty")]
    EmptyMarker(&'static str),
}

/// Tuning for port negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatorConfig {
    /// Candidate ports, tried in ascending order. The end is exclusive.
    pub ports: Range<u16>,
    /// How long one attempt may run without printing either marker.
    pub startup_timeout: Duration,
    /// Sleep between polls of the server's output and status.
    pub poll_interval: Duration,
    /// After the server exits, how long to wait for its output pipes to
    /// close before classifying the exit.
    pub exit_drain_grace: Duration,
    /// Grace period between SIGTERM and SIGKILL when stopping the server.
    pub stop_timeout: Duration,
    pub ready_marker: String,
    pub conflict_marker: String,
}

impl NegotiatorConfig {
    pub const DEFAULT_PORT_START: u16 = 8989;
    pub const DEFAULT_PORT_END: u16 = 10000;
    /// `bazel run` may have to build the server first.
    pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_EXIT_DRAIN_GRACE: Duration = Duration::from_secs(1);

    pub fn with_ports(mut self, ports: Range<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Build the detector for the configured markers.
    pub fn detector(&self) -> ReadinessDetector {
        ReadinessDetector::new(&self.ready_marker, &self.conflict_marker)
    }

    /// Check the settings are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::EmptyPortRange {
                start: self.ports.start,
                end: self.ports.end,
            });
        }
        for (name, value) in [
            ("startup timeout", self.startup_timeout),
            ("poll interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.ready_marker.is_empty() {
            return Err(ConfigError::EmptyMarker("ready"));
        }
        if self.conflict_marker.is_empty() {
            return Err(ConfigError::EmptyMarker("conflict"));
        }
        Ok(())
    }
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            ports: Self::DEFAULT_PORT_START..Self::DEFAULT_PORT_END,
            startup_timeout: Self::DEFAULT_STARTUP_TIMEOUT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            exit_drain_grace: Self::DEFAULT_EXIT_DRAIN_GRACE,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            ready_marker: READY_MARKER.to_owned(),
            conflict_marker: CONFLICT_MARKER.to_owned(),
        }
    }
}
