//! Child-process supervision for the package index server.
//!
//! # Architecture
//!
//! ```text
//! PortNegotiator
//!     |
//!     v
//! Launcher --spawn(spec, port)--> Spawned { process, output }
//!                                    |          |
//!          poll / terminate / await_exit        OutputSink <-- pipe readers
//! ```
//!
//! [`Launcher`] and [`ManagedProcess`] are object-safe so the negotiator can
//! drive a real [`LocalLauncher`] or a scripted stand-in in tests.

pub mod local;
pub mod output;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

pub use local::{LocalLauncher, LocalProcess};
pub use output::{OutputChunk, OutputSink, StreamKind};

/// Variables stripped from the child's environment.
///
/// The server runs under `bazel run`, which resolves its own runfiles. If the
/// harness's runfiles variables leak through, the child resolves resources
/// relative to the harness instead.
pub const SANITIZED_ENV_VARS: &[&str] = &["RUNFILES_DIR", "RUNFILES_MANIFEST_FILE", "PYTHONPATH"];

/// Bazel target that wraps pypiserver.
pub const DEFAULT_SERVER_TARGET: &str = "//wheels:pypiserver_runner";

/// The argument carrying the candidate port. Always the last argument.
pub fn port_arg(port: u16) -> String {
    format!("--port={port}")
}

/// Everything needed to start the server, minus the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program to execute.
    pub program: PathBuf,
    /// Static arguments, placed before the port argument.
    pub args: Vec<String>,
    /// Working directory for the child (the scratch directory).
    pub working_dir: PathBuf,
    /// Extra variables set in the child's environment.
    pub env_vars: HashMap<String, String>,
    /// Variables removed from the inherited environment.
    pub env_remove: Vec<String>,
}

impl LaunchSpec {
    /// A spec with no arguments and the default sanitized environment.
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env_vars: HashMap::new(),
            env_remove: SANITIZED_ENV_VARS.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// `<bazel> run <target> --` in `working_dir`.
    pub fn bazel_run(
        bazel_binary: impl Into<PathBuf>,
        target: &str,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::new(bazel_binary, working_dir).args(["run", target, "--"])
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// The full argument vector for one attempt on `port`.
    pub fn argv_for_port(&self, port: u16) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.push(port_arg(port));
        argv
    }

    /// Human-readable command line, for logs.
    pub fn display_command(&self, port: u16) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.argv_for_port(port));
        parts.join(" ")
    }
}

/// Whether a supervised process is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// `code` is `None` when the process was ended by a signal.
    Exited { code: Option<i32> },
}

impl ProcessStatus {
    pub fn has_exited(&self) -> bool {
        matches!(self, Self::Exited { .. })
    }
}

/// A freshly spawned server: the process handle plus its captured output.
pub struct Spawned {
    pub process: Box<dyn ManagedProcess>,
    pub output: OutputSink,
}

/// Starts server processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn the server described by `spec` on `port`, capturing combined
    /// stdout and stderr.
    async fn spawn(&self, spec: &LaunchSpec, port: u16) -> Result<Spawned>;
}

/// Handle to one running (or exited) server process.
#[async_trait]
pub trait ManagedProcess: Send {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness check.
    fn poll(&mut self) -> Result<ProcessStatus>;

    /// Ask the process to stop. A no-op if it has already exited.
    async fn terminate(&mut self) -> Result<()>;

    /// Block until the process has exited and been reaped. Safe to call
    /// repeatedly.
    async fn await_exit(&mut self) -> Result<Option<i32>>;

    /// Terminate and wait. This is the release step registered for cleanup;
    /// calling it again after success is a no-op.
    async fn stop(&mut self) -> Result<Option<i32>> {
        self.terminate().await?;
        self.await_exit().await
    }
}

// Both traits are used as trait objects.
const _: () = {
    fn _assert_object_safe(_: &dyn Launcher, _: &dyn ManagedProcess) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_arg_is_last() {
        let spec = LaunchSpec::new("/usr/bin/server", "/tmp").args(["run", "-v"]);
        assert_eq!(spec.argv_for_port(8989), vec!["run", "-v", "--port=8989"]);
    }

    #[test]
    fn bazel_run_layout() {
        let spec = LaunchSpec::bazel_run("/opt/bazel", DEFAULT_SERVER_TARGET, "/scratch");
        assert_eq!(
            spec.argv_for_port(9000),
            vec!["run", "//wheels:pypiserver_runner", "--", "--port=9000"]
        );
        assert_eq!(spec.working_dir, PathBuf::from("/scratch"));
        assert_eq!(
            spec.display_command(9000),
            "/opt/bazel run //wheels:pypiserver_runner -- --port=9000"
        );
    }

    #[test]
    fn default_env_strips_runfiles() {
        let spec = LaunchSpec::new("server", "/tmp");
        for var in ["RUNFILES_DIR", "RUNFILES_MANIFEST_FILE", "PYTHONPATH"] {
            assert!(spec.env_remove.iter().any(|v| v == var), "{var} not stripped");
        }
    }

    #[test]
    fn env_builder_records_vars() {
        let spec = LaunchSpec::new("server", "/tmp").env("WHEELHOUSE_TEST", "1");
        assert_eq!(spec.env_vars.get("WHEELHOUSE_TEST").map(String::as_str), Some("1"));
    }

    #[test]
    fn status_has_exited() {
        assert!(!ProcessStatus::Running.has_exited());
        assert!(ProcessStatus::Exited { code: Some(1) }.has_exited());
        assert!(ProcessStatus::Exited { code: None }.has_exited());
    }
}
