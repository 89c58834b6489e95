//! Shared test utilities for wheelhouse tests.
//!
//! Provides executable shell scripts that stand in for the package index
//! server, plus helpers for finding and occupying local ports.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Write `body` to `dir/name` behind a `#!/bin/sh` line and make it
/// executable.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("failed to write script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make script executable");
    }

    path
}

/// Shell snippet that sets `$port` from a trailing `--port=N` argument.
const PARSE_PORT: &str = r#"port=""
for arg in "$@"; do
  case "$arg" in
    --port=*) port="${arg#--port=}" ;;
  esac
done
"#;

/// A fake server that reports a conflict on every port in `busy_ports`
/// and becomes ready on any other port.
///
/// Every port it is started with is appended to `attempts.log` next to the
/// script, one per line; see [`read_attempts`].
pub fn fake_server(dir: &Path, busy_ports: &[u16]) -> PathBuf {
    let busy = busy_ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    let log = dir.join("attempts.log");
    let body = format!(
        r#"{PARSE_PORT}echo "$port" >> '{log}'
case " {busy} " in
  *" $port "*)
    echo "Starting up pypiserver_runner."
    echo "OSError: [Errno 98] Address already in use" >&2
    exit 1
    ;;
esac
echo "Serving on http://0.0.0.0:$port"
echo "Hit Ctrl-C to quit."
exec sleep 3600
"#,
        log = log.display(),
    );
    write_script(dir, "fake_server.sh", &body)
}

/// A fake server that prints `output` and exits with `code`, whatever the
/// port.
pub fn exiting_server(dir: &Path, output: &str, code: i32) -> PathBuf {
    let log = dir.join("attempts.log");
    let body = format!(
        "{PARSE_PORT}echo \"$port\" >> '{log}'\necho '{output}'\nexit {code}\n",
        log = log.display(),
    );
    write_script(dir, "exiting_server.sh", &body)
}

/// A fake server that prints the ready banner in two writes with a pause in
/// between, so the marker arrives split across reads.
pub fn slow_banner_server(dir: &Path) -> PathBuf {
    let body = "printf 'Hit Ctrl-C to'\nsleep 0.3\nprintf ' quit.\\n'\nexec sleep 3600\n";
    write_script(dir, "slow_banner.sh", body)
}

/// A fake server that starts but never prints anything.
pub fn silent_server(dir: &Path) -> PathBuf {
    let log = dir.join("attempts.log");
    let body = format!(
        "{PARSE_PORT}echo \"$port\" >> '{log}'\nexec sleep 3600\n",
        log = log.display(),
    );
    write_script(dir, "silent_server.sh", &body)
}

/// Ports a fake server was started with, in order.
pub fn read_attempts(dir: &Path) -> Vec<u16> {
    std::fs::read_to_string(dir.join("attempts.log"))
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Bind an ephemeral localhost port and keep it occupied for as long as the
/// returned listener lives.
pub fn occupy_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind ephemeral port");
    let port = listener.local_addr().expect("no local addr").port();
    (listener, port)
}

/// Return `true` if `pid` still names a live process.
#[cfg(target_os = "linux")]
pub fn pid_is_alive(pid: u32) -> bool {
    // A reaped process has no /proc entry; a zombie reports state `Z`.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z"),
        Err(_) => false,
    }
}

/// Wait for a fake server to write its pid to `path` and return it.
pub fn wait_for_pid_file(path: &Path, timeout: Duration) -> u32 {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(pid) = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| text.trim().parse().ok())
        {
            return pid;
        }
        assert!(
            Instant::now() < deadline,
            "no pid written to {} within {timeout:?}",
            path.display()
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Wait up to `timeout` for `pid` to die. Returns `false` if it is still
/// alive at the deadline.
#[cfg(target_os = "linux")]
pub fn wait_for_pid_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while pid_is_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    true
}
