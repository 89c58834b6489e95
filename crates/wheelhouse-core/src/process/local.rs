//! Local subprocess launcher built on `tokio::process`.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::output::{self, OutputSink, StreamKind};
use super::{LaunchSpec, Launcher, ManagedProcess, ProcessStatus, Spawned};

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the pipe readers after the process has been reaped.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawns servers as local child processes.
///
/// Each child is placed in its own process group so that terminating it
/// also reaches anything it started (`bazel run` forks the actual server).
#[derive(Debug, Clone)]
pub struct LocalLauncher {
    stop_timeout: Duration,
}

impl LocalLauncher {
    pub fn new(stop_timeout: Duration) -> Self {
        Self { stop_timeout }
    }
}

impl Default for LocalLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_TIMEOUT)
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    async fn spawn(&self, spec: &LaunchSpec, port: u16) -> Result<Spawned> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(spec.argv_for_port(port))
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for key in &spec.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &spec.env_vars {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn `{}` in {}",
                spec.display_command(port),
                spec.working_dir.display()
            )
        })?;

        let pid = child.id();
        debug!(port, pid, "spawned server process");

        let (tx, rx) = output::output_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(output::spawn_pipe_reader(stdout, StreamKind::Stdout, port, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(output::spawn_pipe_reader(stderr, StreamKind::Stderr, port, tx.clone()));
        }
        // The channel closes once both readers have hit end-of-file.
        drop(tx);

        Ok(Spawned {
            process: Box::new(LocalProcess {
                child,
                pid,
                port,
                exit_code: None,
                readers,
                stop_timeout: self.stop_timeout,
            }),
            output: OutputSink::new(rx),
        })
    }
}

/// A server running as a local child process.
pub struct LocalProcess {
    child: Child,
    /// Captured at spawn; `Child::id` returns `None` once reaped.
    pid: Option<u32>,
    port: u16,
    /// `Some` once the exit status has been observed.
    exit_code: Option<Option<i32>>,
    readers: Vec<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl std::fmt::Debug for LocalProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcess")
            .field("pid", &self.pid)
            .field("port", &self.port)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

impl LocalProcess {
    fn record_exit(&mut self, status: std::process::ExitStatus) -> Option<i32> {
        let code = status.code();
        self.exit_code = Some(code);
        code
    }

    /// Send `signal` to every process in the server's group.
    ///
    /// The group can outlive its leader, so this is attempted even after the
    /// leader has exited. An empty group (`ESRCH`) is not an error.
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) {
        let Some(pid) = self.pid else {
            return;
        };
        // SAFETY: plain syscall. A group id is not reused while any member
        // of the group is still alive.
        let ret = unsafe { libc::kill(-(pid as i32), signal) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(port = self.port, pid, signal, error = %err, "failed to signal server process group");
            }
        }
    }

    /// Force-kill the whole group. Last resort after SIGTERM was ignored.
    async fn force_kill(&mut self) -> Result<()> {
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        self.child
            .kill()
            .await
            .with_context(|| format!("failed to kill server on port {}", self.port))
    }

    async fn join_readers(&mut self) {
        for reader in self.readers.drain(..) {
            if tokio::time::timeout(READER_JOIN_TIMEOUT, reader).await.is_err() {
                warn!(port = self.port, "output reader still running after server exit");
            }
        }
    }
}

#[async_trait]
impl ManagedProcess for LocalProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn poll(&mut self) -> Result<ProcessStatus> {
        if let Some(code) = self.exit_code {
            return Ok(ProcessStatus::Exited { code });
        }
        let status = self
            .child
            .try_wait()
            .with_context(|| format!("failed to check server on port {}", self.port))?;
        Ok(match status {
            Some(status) => ProcessStatus::Exited {
                code: self.record_exit(status),
            },
            None => ProcessStatus::Running,
        })
    }

    async fn terminate(&mut self) -> Result<()> {
        let exited = self.poll()?.has_exited();
        if exited {
            debug!(port = self.port, "server already exited, signalling what is left of its group");
        }

        #[cfg(unix)]
        self.signal_group(libc::SIGTERM);

        #[cfg(not(unix))]
        if !exited {
            self.child
                .start_kill()
                .with_context(|| format!("failed to signal server on port {}", self.port))?;
        }

        Ok(())
    }

    async fn await_exit(&mut self) -> Result<Option<i32>> {
        let code = match self.exit_code {
            Some(code) => code,
            None => {
                let status = self
                    .child
                    .wait()
                    .await
                    .with_context(|| format!("failed to wait on server on port {}", self.port))?;
                self.record_exit(status)
            }
        };
        self.join_readers().await;
        Ok(code)
    }

    async fn stop(&mut self) -> Result<Option<i32>> {
        self.terminate().await?;

        if self.exit_code.is_none() {
            match tokio::time::timeout(self.stop_timeout, self.child.wait()).await {
                Ok(status) => {
                    let status = status.with_context(|| {
                        format!("failed to wait on server on port {}", self.port)
                    })?;
                    self.record_exit(status);
                    debug!(port = self.port, "server exited after SIGTERM");
                }
                Err(_) => {
                    warn!(
                        port = self.port,
                        timeout = ?self.stop_timeout,
                        "server ignored SIGTERM, sending SIGKILL"
                    );
                    self.force_kill().await?;
                }
            }
        }

        self.await_exit().await
    }
}

/// `kill_on_drop` only reaches the leader. A process dropped before it was
/// stopped (an interrupted negotiation, a panic) takes its whole group down.
impl Drop for LocalProcess {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            #[cfg(unix)]
            self.signal_group(libc::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wheelhouse_test_utils::write_script;

    async fn wait_until_exited(process: &mut Box<dyn ManagedProcess>) -> ProcessStatus {
        for _ in 0..50 {
            let status = process.poll().unwrap();
            if status.has_exited() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process did not exit within 2.5 seconds");
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "both.sh",
            "echo to-stdout\necho to-stderr >&2\n",
        );

        let launcher = LocalLauncher::default();
        let spec = LaunchSpec::new(&script, tmp.path());
        let Spawned { mut process, mut output } = launcher.spawn(&spec, 8989).await.unwrap();

        assert_eq!(process.await_exit().await.unwrap(), Some(0));
        output.drain_to_end().await;

        assert_eq!(output.stream(StreamKind::Stdout), "to-stdout\n");
        assert_eq!(output.stream(StreamKind::Stderr), "to-stderr\n");
    }

    #[tokio::test]
    async fn passes_port_as_last_argument() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "args.sh", "echo \"args: $*\"\n");

        let launcher = LocalLauncher::default();
        let spec = LaunchSpec::new(&script, tmp.path()).args(["run", "-v"]);
        let Spawned { mut process, mut output } = launcher.spawn(&spec, 9123).await.unwrap();

        process.await_exit().await.unwrap();
        output.drain_to_end().await;
        assert!(
            output
                .stream(StreamKind::Stdout)
                .contains("args: run -v --port=9123")
        );
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("scratch");
        std::fs::create_dir(&work).unwrap();
        let script = write_script(tmp.path(), "pwd.sh", "pwd\n");

        let launcher = LocalLauncher::default();
        let spec = LaunchSpec::new(&script, &work);
        let Spawned { mut process, mut output } = launcher.spawn(&spec, 8989).await.unwrap();

        process.await_exit().await.unwrap();
        output.drain_to_end().await;
        let printed = std::path::PathBuf::from(output.stream(StreamKind::Stdout).trim());
        assert_eq!(
            printed.canonicalize().unwrap(),
            work.canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn removes_inherited_variables() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "env.sh",
            "echo \"home=[$HOME] extra=[$WHEELHOUSE_EXTRA]\"\n",
        );

        // HOME is inherited from the test runner; stripping it goes through
        // the same path as the runfiles variables.
        let launcher = LocalLauncher::default();
        let mut spec = LaunchSpec::new(&script, tmp.path()).env("WHEELHOUSE_EXTRA", "yes");
        spec.env_remove.push("HOME".to_string());
        let Spawned { mut process, mut output } = launcher.spawn(&spec, 8989).await.unwrap();

        process.await_exit().await.unwrap();
        output.drain_to_end().await;
        let text = output.stream(StreamKind::Stdout);
        assert!(text.contains("home=[]"), "got: {text:?}");
        assert!(text.contains("extra=[yes]"), "got: {text:?}");
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "fail.sh", "exit 3\n");

        let launcher = LocalLauncher::default();
        let spec = LaunchSpec::new(&script, tmp.path());
        let Spawned { mut process, .. } = launcher.spawn(&spec, 8989).await.unwrap();

        assert_eq!(
            wait_until_exited(&mut process).await,
            ProcessStatus::Exited { code: Some(3) }
        );
    }

    #[tokio::test]
    async fn stop_terminates_long_running_server() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "sleepy.sh", "echo up\nsleep 3600\n");

        let launcher = LocalLauncher::default();
        let spec = LaunchSpec::new(&script, tmp.path());
        let Spawned { mut process, .. } = launcher.spawn(&spec, 8989).await.unwrap();

        assert_eq!(process.poll().unwrap(), ProcessStatus::Running);
        process.stop().await.unwrap();
        assert!(process.poll().unwrap().has_exited());
    }

    #[tokio::test]
    async fn stop_escalates_when_sigterm_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "stubborn.sh",
            "trap '' TERM\nwhile true; do sleep 1; done\n",
        );

        let launcher = LocalLauncher::new(Duration::from_millis(300));
        let spec = LaunchSpec::new(&script, tmp.path());
        let Spawned { mut process, .. } = launcher.spawn(&spec, 8989).await.unwrap();

        // Give the shell a moment to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let code = process.stop().await.unwrap();
        assert_eq!(code, None, "SIGKILL leaves no exit code");
    }

    #[tokio::test]
    async fn terminate_and_wait_are_idempotent_after_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "quick.sh", "exit 0\n");

        let launcher = LocalLauncher::default();
        let spec = LaunchSpec::new(&script, tmp.path());
        let Spawned { mut process, .. } = launcher.spawn(&spec, 8989).await.unwrap();

        wait_until_exited(&mut process).await;
        process.terminate().await.unwrap();
        assert_eq!(process.await_exit().await.unwrap(), Some(0));
        assert_eq!(process.stop().await.unwrap(), Some(0));
    }

    /// Leader exits at once, leaving a forked child in its group.
    #[cfg(target_os = "linux")]
    fn forking_script(dir: &std::path::Path, leader_exit: Option<i32>) -> std::path::PathBuf {
        let tail = match leader_exit {
            Some(code) => format!("exit {code}\n"),
            None => "wait\n".to_string(),
        };
        let body = format!(
            "sleep 3600 >/dev/null 2>&1 &\necho $! > '{pid}'\n{tail}",
            pid = dir.join("child.pid").display(),
        );
        write_script(dir, "forking.sh", &body)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn stop_reaches_children_after_leader_exits() {
        use wheelhouse_test_utils::{wait_for_pid_exit, wait_for_pid_file};

        let tmp = tempfile::tempdir().unwrap();
        let script = forking_script(tmp.path(), Some(1));

        let launcher = LocalLauncher::new(Duration::from_secs(1));
        let spec = LaunchSpec::new(&script, tmp.path());
        let Spawned { mut process, .. } = launcher.spawn(&spec, 8989).await.unwrap();

        let child = wait_for_pid_file(&tmp.path().join("child.pid"), Duration::from_secs(5));
        wait_until_exited(&mut process).await;

        assert_eq!(process.stop().await.unwrap(), Some(1));
        assert!(
            wait_for_pid_exit(child, Duration::from_secs(5)),
            "forked child {child} survived stop"
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropping_a_running_process_kills_its_group() {
        use wheelhouse_test_utils::{pid_is_alive, wait_for_pid_exit, wait_for_pid_file};

        let tmp = tempfile::tempdir().unwrap();
        let script = forking_script(tmp.path(), None);

        let launcher = LocalLauncher::default();
        let spec = LaunchSpec::new(&script, tmp.path());
        let Spawned { process, output } = launcher.spawn(&spec, 8989).await.unwrap();

        let child = wait_for_pid_file(&tmp.path().join("child.pid"), Duration::from_secs(5));
        assert!(pid_is_alive(child));

        drop(process);
        drop(output);
        assert!(
            wait_for_pid_exit(child, Duration::from_secs(5)),
            "forked child {child} survived drop"
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let launcher = LocalLauncher::default();
        let spec = LaunchSpec::new("/nonexistent/wheelhouse/server", "/tmp");

        let err = launcher.spawn(&spec, 8989).await.err().expect("spawn should fail");
        let message = format!("{err:#}");
        assert!(message.contains("failed to spawn"), "got: {message}");
        assert!(message.contains("--port=8989"), "got: {message}");
    }
}
