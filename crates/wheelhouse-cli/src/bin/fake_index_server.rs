//! Stand-in for pypiserver used by the integration tests.
//!
//! Binds `127.0.0.1:<port>` for real and prints the same banner lines the
//! real server prints, so the harness sees genuine port conflicts.

use std::io::ErrorKind;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "fake-index-server")]
struct Args {
    /// Port to listen on
    #[arg(long)]
    port: u16,

    /// Exit with this code right after binding instead of serving
    #[arg(long)]
    exit_after_bind: Option<i32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let listener = match TcpListener::bind(("127.0.0.1", args.port)).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            eprintln!("OSError: [Errno 98] Address already in use");
            std::process::exit(1);
        }
        Err(e) => return Err(e).context("failed to bind"),
    };

    if let Some(code) = args.exit_after_bind {
        eprintln!("fake-index-server: exiting with {code}");
        std::process::exit(code);
    }

    println!("Serving on http://127.0.0.1:{}", args.port);
    println!("Hit Ctrl-C to quit.");

    loop {
        // Accept and immediately close; readiness is all the tests need.
        let (stream, _) = listener.accept().await.context("accept failed")?;
        drop(stream);
    }
}
