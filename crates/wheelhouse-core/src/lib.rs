//! Core of the wheelhouse test harness.
//!
//! Brings up a local package index server as a subprocess on the first free
//! port in a range, detects readiness from its output, and tears it down
//! through an explicit [`CleanupRegistry`].

pub mod cleanup;
pub mod config;
pub mod fixup;
pub mod negotiator;
pub mod process;
pub mod readiness;

pub use cleanup::{CleanupRegistry, CleanupReport};
pub use config::{ConfigError, NegotiatorConfig};
pub use fixup::{FixupSummary, fix_up_intermediate_files, index_url};
pub use negotiator::{NegotiationError, NegotiationResult, PortNegotiator, StartupError};
pub use process::{LaunchSpec, Launcher, LocalLauncher, ManagedProcess, ProcessStatus, Spawned};
pub use readiness::ReadinessDetector;
