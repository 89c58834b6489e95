//! Configuration for the wheelhouse harness.
//!
//! An optional TOML file at `~/.config/wheelhouse/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use wheelhouse_core::NegotiatorConfig;
use wheelhouse_core::process::{DEFAULT_SERVER_TARGET, LaunchSpec};

pub const BAZEL_BINARY_ENV: &str = "BIT_BAZEL_BINARY";
pub const WORKSPACE_DIR_ENV: &str = "BIT_WORKSPACE_DIR";
pub const CONFIG_PATH_ENV: &str = "WHEELHOUSE_CONFIG";

const DEFAULT_BAZEL_BINARY: &str = "bazel";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub ports: PortsSection,
    pub startup: StartupSection,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// Bazel target wrapping the package index server.
    pub target: Option<String>,
    /// Arguments passed to the server before `--port=<N>`.
    pub extra_args: Vec<String>,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortsSection {
    pub start: Option<u16>,
    /// Exclusive.
    pub end: Option<u16>,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StartupSection {
    pub timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub stop_timeout_secs: Option<u64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the wheelhouse config directory: `$XDG_CONFIG_HOME/wheelhouse`
/// or `~/.config/wheelhouse`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("wheelhouse");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("wheelhouse")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read
// -----------------------------------------------------------------------

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Find and load the config file, if any.
///
/// An explicitly named file (flag or env var) must exist. The default
/// location is optional.
fn locate_config(
    cli_path: Option<&Path>,
    env: &dyn Fn(&str) -> Option<String>,
    default_path: &Path,
) -> Result<ConfigFile> {
    if let Some(path) = cli_path {
        return load_config(path);
    }
    if let Some(path) = env(CONFIG_PATH_ENV) {
        return load_config(Path::new(&path));
    }
    if default_path.exists() {
        return load_config(default_path);
    }
    Ok(ConfigFile::default())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Settings that can be given on the command line.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub bazel_binary: Option<PathBuf>,
    pub workspace_dir: Option<PathBuf>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct HarnessConfig {
    pub bazel_binary: PathBuf,
    /// Only needed when the harness provisions its own scratch directory.
    pub workspace_dir: Option<PathBuf>,
    pub server_target: String,
    pub server_args: Vec<String>,
    pub negotiator: NegotiatorConfig,
}

impl HarnessConfig {
    /// Resolve configuration from the process environment.
    pub fn resolve(overrides: &CliOverrides) -> Result<Self> {
        Self::resolve_with(overrides, &|key| std::env::var(key).ok(), &config_path())
    }

    /// Resolve using the chain: CLI flag > env var > config file > default.
    ///
    /// - Bazel binary: `--bazel-binary` > `BIT_BAZEL_BINARY` > `bazel`
    /// - Workspace dir: `--workspace-dir` > `BIT_WORKSPACE_DIR` > unset
    /// - Server target, ports and startup timings: config file > defaults
    pub fn resolve_with(
        overrides: &CliOverrides,
        env: &dyn Fn(&str) -> Option<String>,
        default_path: &Path,
    ) -> Result<Self> {
        let file = locate_config(overrides.config.as_deref(), env, default_path)?;

        let bazel_binary = overrides
            .bazel_binary
            .clone()
            .or_else(|| env(BAZEL_BINARY_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BAZEL_BINARY));

        let workspace_dir = overrides
            .workspace_dir
            .clone()
            .or_else(|| env(WORKSPACE_DIR_ENV).map(PathBuf::from));

        let negotiator = negotiator_config(&file);
        negotiator
            .validate()
            .context("invalid negotiation settings")?;

        Ok(Self {
            bazel_binary,
            workspace_dir,
            server_target: file
                .server
                .target
                .unwrap_or_else(|| DEFAULT_SERVER_TARGET.to_string()),
            server_args: file.server.extra_args,
            negotiator,
        })
    }

    /// How to launch the server in `scratch_dir`.
    pub fn launch_spec(&self, scratch_dir: &Path) -> LaunchSpec {
        LaunchSpec::bazel_run(&self.bazel_binary, &self.server_target, scratch_dir)
            .args(self.server_args.iter().cloned())
    }
}

fn negotiator_config(file: &ConfigFile) -> NegotiatorConfig {
    let start = file
        .ports
        .start
        .unwrap_or(NegotiatorConfig::DEFAULT_PORT_START);
    let end = file.ports.end.unwrap_or(NegotiatorConfig::DEFAULT_PORT_END);
    let mut config = NegotiatorConfig::default().with_ports(start..end);
    if let Some(secs) = file.startup.timeout_secs {
        config = config.with_startup_timeout(Duration::from_secs(secs));
    }
    if let Some(ms) = file.startup.poll_interval_ms {
        config = config.with_poll_interval(Duration::from_millis(ms));
    }
    if let Some(secs) = file.startup.stop_timeout_secs {
        config = config.with_stop_timeout(Duration::from_secs(secs));
    }
    config
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
