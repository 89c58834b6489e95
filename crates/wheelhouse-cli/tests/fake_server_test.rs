//! Negotiation against `fake-index-server`, which binds real sockets.
//!
//! Unlike the shell-script fakes, conflicts here come from the kernel: a
//! port held by the test is genuinely in use.

use std::net::TcpStream;
use std::time::Duration;

use wheelhouse_core::{
    CleanupRegistry, LaunchSpec, LocalLauncher, NegotiationResult, NegotiatorConfig,
    PortNegotiator, StartupError,
};
use wheelhouse_test_utils::occupy_port;

const FAKE_SERVER: &str = env!("CARGO_BIN_EXE_fake-index-server");

fn test_config() -> NegotiatorConfig {
    NegotiatorConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_startup_timeout(Duration::from_secs(20))
        .with_stop_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn occupied_port_is_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let (_held, busy) = occupy_port();

    let launcher = LocalLauncher::default();
    let cleanup = CleanupRegistry::new();
    let negotiator = PortNegotiator::new(&launcher, &cleanup, test_config());
    let spec = LaunchSpec::new(FAKE_SERVER, tmp.path());

    let result = negotiator
        .negotiate(busy..busy.saturating_add(20), &spec)
        .await;

    let port = result.port().unwrap_or_else(|| panic!("expected Bound, got {result:?}"));
    assert!(port > busy, "bound {port}, which is not after the busy port {busy}");
    assert!(
        TcpStream::connect(("127.0.0.1", port)).is_ok(),
        "nothing listening on the bound port"
    );
    assert_eq!(cleanup.len(), 1);

    let report = cleanup.run_all().await;
    assert!(report.is_clean(), "cleanup failures: {:?}", report.failed);
    assert!(
        TcpStream::connect(("127.0.0.1", port)).is_err(),
        "server still listening after cleanup"
    );
}

#[tokio::test]
async fn single_busy_port_is_exhausted() {
    let tmp = tempfile::tempdir().unwrap();
    let (_held, busy) = occupy_port();

    let launcher = LocalLauncher::default();
    let cleanup = CleanupRegistry::new();
    let negotiator = PortNegotiator::new(&launcher, &cleanup, test_config());
    let spec = LaunchSpec::new(FAKE_SERVER, tmp.path());

    let result = negotiator.negotiate(busy..busy + 1, &spec).await;

    assert!(
        matches!(result, NegotiationResult::Exhausted { .. }),
        "got {result:?}"
    );
    assert!(cleanup.is_empty());
}

#[tokio::test]
async fn exit_after_bind_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let free = {
        let (listener, port) = occupy_port();
        drop(listener);
        port
    };

    let launcher = LocalLauncher::default();
    let cleanup = CleanupRegistry::new();
    let negotiator = PortNegotiator::new(&launcher, &cleanup, test_config());
    let spec = LaunchSpec::new(FAKE_SERVER, tmp.path()).args(["--exit-after-bind", "2"]);

    let result = negotiator.negotiate(free..free.saturating_add(5), &spec).await;

    match result {
        NegotiationResult::Fatal(StartupError::Exited {
            port,
            exit_code,
            output,
        }) => {
            assert_eq!(port, free);
            assert_eq!(exit_code, Some(2));
            assert!(output.contains("exiting with 2"), "got: {output:?}");
        }
        other => panic!("expected Fatal(Exited), got {other:?}"),
    }
}
