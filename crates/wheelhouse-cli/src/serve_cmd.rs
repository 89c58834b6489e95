//! `wheelhouse serve`: start the index server and keep it up until
//! interrupted.

use std::path::Path;

use anyhow::{Context, Result};

use wheelhouse_core::{CleanupRegistry, index_url};

use crate::config::HarnessConfig;
use crate::run_cmd::start_server;

/// Start the server in `dir` and wait for Ctrl-C. The server itself is
/// stopped by `cleanup`.
pub async fn run_serve(config: &HarnessConfig, dir: &Path, cleanup: &CleanupRegistry) -> Result<()> {
    let dir = dir
        .canonicalize()
        .with_context(|| format!("serve directory {} does not exist", dir.display()))?;
    let port = start_server(config, &dir, cleanup).await?;

    println!("{}", index_url(port));
    println!("Serving {} until Ctrl-C.", dir.display());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    Ok(())
}
