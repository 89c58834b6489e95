mod config;
mod fixup_cmd;
mod run_cmd;
mod scratch;
mod serve_cmd;

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use futures::FutureExt;
use tracing::warn;

use wheelhouse_core::CleanupRegistry;

use config::{CliOverrides, HarnessConfig};
use run_cmd::RunOptions;

/// Exit code when the harness itself fails.
const EXIT_FAILURE: i32 = 1;
/// Exit code when interrupted with Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(
    name = "wheelhouse",
    about = "Run bazel tests against a local package index server"
)]
struct Cli {
    /// Config file (overrides WHEELHOUSE_CONFIG env var)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bazel binary (overrides BIT_BAZEL_BINARY env var)
    #[arg(long, global = true)]
    bazel_binary: Option<PathBuf>,

    /// Workspace under test (overrides BIT_WORKSPACE_DIR env var)
    #[arg(long, global = true)]
    workspace_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the index server, fix up intermediate files and run bazel test
    Run {
        /// Use an existing scratch directory instead of creating one
        #[arg(long)]
        scratch_dir: Option<PathBuf>,
        /// Script that creates the scratch directory and prints its path
        #[arg(long, default_value = scratch::DEFAULT_SCRATCH_SCRIPT)]
        scratch_script: PathBuf,
        /// Targets passed to `bazel test`
        #[arg(default_values_t = [String::from("//...")])]
        targets: Vec<String>,
    },
    /// Start the index server in a directory and keep it up until Ctrl-C
    Serve {
        /// Working directory for the server
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Point intermediate files at an index server on the given port
    Fixup {
        /// Directory containing intermediate_file_*.json
        #[arg(long)]
        dir: PathBuf,
        /// Port of the running index server
        #[arg(long)]
        port: u16,
    },
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            config: self.config.clone(),
            bazel_binary: self.bazel_binary.clone(),
            workspace_dir: self.workspace_dir.clone(),
        }
    }
}

/// Run one command and return the process exit code.
async fn dispatch(cli: Cli, cleanup: &CleanupRegistry) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Fixup { ref dir, port } => {
            fixup_cmd::run_fixup(dir, port)?;
            Ok(0)
        }
        Commands::Serve { ref dir } => {
            let resolved = HarnessConfig::resolve(&cli.overrides())?;
            serve_cmd::run_serve(&resolved, dir, cleanup).await?;
            Ok(0)
        }
        Commands::Run {
            ref scratch_dir,
            ref scratch_script,
            ref targets,
        } => {
            let resolved = HarnessConfig::resolve(&cli.overrides())?;
            let options = RunOptions {
                scratch_dir: scratch_dir.clone(),
                scratch_script: scratch_script.clone(),
                targets: targets.clone(),
            };
            run_cmd::run_harness(&resolved, &options, cleanup).await
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Ctrl-C is the normal way to end `serve`.
    let interrupted_code = match cli.command {
        Commands::Serve { .. } => 0,
        _ => EXIT_INTERRUPTED,
    };

    // -----------------------------------------------------------------
    // Every exit path below goes through `cleanup.run_all()`: success,
    // error, panic inside a command, and Ctrl-C.
    // -----------------------------------------------------------------
    let cleanup = CleanupRegistry::new();

    let outcome = tokio::select! {
        result = AssertUnwindSafe(dispatch(cli, &cleanup)).catch_unwind() => {
            result.unwrap_or_else(|_| Err(anyhow!("wheelhouse panicked")))
        }
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!("interrupted, cleaning up");
            Ok(interrupted_code)
        }
    };

    let report = cleanup.run_all().await;
    if !report.is_clean() {
        warn!(failed = ?report.failed, "some cleanup actions failed");
    }

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(EXIT_FAILURE);
        }
    }
}
