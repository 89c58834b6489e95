//! `wheelhouse run`: the full test harness.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{info, warn};

use wheelhouse_core::{CleanupRegistry, LocalLauncher, PortNegotiator, fix_up_intermediate_files};

use crate::config::HarnessConfig;
use crate::scratch;

#[derive(Debug)]
pub struct RunOptions {
    /// Use this directory instead of provisioning one.
    pub scratch_dir: Option<PathBuf>,
    pub scratch_script: PathBuf,
    pub targets: Vec<String>,
}

/// Start the index server, point the workspace at it and run `bazel test`.
///
/// Returns the test command's exit code. Everything registered with
/// `cleanup` is left for the caller to run.
pub async fn run_harness(
    config: &HarnessConfig,
    options: &RunOptions,
    cleanup: &CleanupRegistry,
) -> Result<i32> {
    let scratch_dir = match &options.scratch_dir {
        Some(dir) => dir.clone(),
        None => {
            let workspace = config.workspace_dir.as_deref().context(
                "workspace directory not set; pass --workspace-dir or set BIT_WORKSPACE_DIR",
            )?;
            scratch::provision(&options.scratch_script, workspace, cleanup).await?
        }
    };

    let port = start_server(config, &scratch_dir, cleanup).await?;

    let summary = fix_up_intermediate_files(&scratch_dir, port)?;
    info!(
        matched = summary.matched,
        rewritten = summary.rewritten.len(),
        "pointed intermediate files at the package index"
    );

    run_tests(&config.bazel_binary, &options.targets, &scratch_dir).await
}

/// Negotiate a port and start the server in `scratch_dir`.
pub async fn start_server(
    config: &HarnessConfig,
    scratch_dir: &Path,
    cleanup: &CleanupRegistry,
) -> Result<u16> {
    let launcher = LocalLauncher::new(config.negotiator.stop_timeout);
    let negotiator = PortNegotiator::new(&launcher, cleanup, config.negotiator.clone());
    let spec = config.launch_spec(scratch_dir);

    let port = negotiator.negotiate_default(&spec).await.into_result()?;
    Ok(port)
}

async fn run_tests(bazel_binary: &Path, targets: &[String], scratch_dir: &Path) -> Result<i32> {
    info!(?targets, dir = %scratch_dir.display(), "running bazel test");
    let status = Command::new(bazel_binary)
        .arg("test")
        .args(targets)
        .current_dir(scratch_dir)
        // Dropped on Ctrl-C; the test run must not outlive the harness.
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("failed to run {} test", bazel_binary.display()))?;

    match status.code() {
        Some(code) => {
            info!(code, "bazel test finished");
            Ok(code)
        }
        None => {
            warn!(%status, "bazel test was killed by a signal");
            Ok(1)
        }
    }
}
