//! Scratch workspace provisioning.
//!
//! The scratch directory is created by an external script that copies the
//! workspace under test and prints the new directory's path on stdout.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, info};

use wheelhouse_core::CleanupRegistry;

/// Script invoked when `--scratch-script` is not given.
pub const DEFAULT_SCRATCH_SCRIPT: &str = "create_scratch_dir.sh";

/// Run `<script> --workspace <workspace>` and register removal of the
/// directory it prints.
pub async fn provision(
    script: &Path,
    workspace: &Path,
    cleanup: &CleanupRegistry,
) -> Result<PathBuf> {
    let output = Command::new(script)
        .arg("--workspace")
        .arg(workspace)
        .output()
        .await
        .with_context(|| format!("failed to run scratch-dir script {}", script.display()))?;

    if !output.status.success() {
        bail!(
            "scratch-dir script {} failed ({}): {}",
            script.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8(output.stdout).context("scratch-dir script printed non-UTF-8")?;
    let dir = PathBuf::from(stdout.trim());
    if dir.as_os_str().is_empty() {
        bail!("scratch-dir script {} printed no directory", script.display());
    }
    if !dir.is_dir() {
        bail!(
            "scratch-dir script {} printed {}, which is not a directory",
            script.display(),
            dir.display()
        );
    }

    info!(dir = %dir.display(), "provisioned scratch directory");
    let owned = dir.clone();
    cleanup.register(format!("remove scratch directory {}", dir.display()), move || {
        remove_scratch_dir(owned)
    });
    Ok(dir)
}

/// Remove a scratch directory. Already gone counts as success.
async fn remove_scratch_dir(dir: PathBuf) -> Result<()> {
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {
            debug!(dir = %dir.display(), "removed scratch directory");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("failed to remove scratch directory {}", dir.display()))
        }
    }
}
