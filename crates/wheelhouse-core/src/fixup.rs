//! Point generated intermediate files at the negotiated index URL.
//!
//! Earlier build steps write `intermediate_file_*.json` files that embed the
//! index URL with whatever port was current at generation time. Once the
//! real port is known every such URL is rewritten in place.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::{NoExpand, Regex};
use tracing::{debug, info};

/// Files rewritten after a successful bind, relative to the scratch
/// directory.
pub const INTERMEDIATE_FILE_PATTERN: &str = "intermediate_file_*.json";

static INDEX_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"http://localhost:\d+/packages").unwrap());

/// The index URL for a server bound to `port`.
pub fn index_url(port: u16) -> String {
    format!("http://localhost:{port}/packages")
}

/// Replace every index URL in `text` with the one for `port`.
///
/// Returns `Cow::Borrowed` when the text contains no index URL at all.
pub fn rewrite_index_urls(text: &str, port: u16) -> Cow<'_, str> {
    let url = index_url(port);
    INDEX_URL.replace_all(text, NoExpand(&url))
}

/// What [`fix_up_intermediate_files`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixupSummary {
    /// Number of files matching [`INTERMEDIATE_FILE_PATTERN`].
    pub matched: usize,
    /// Files whose contents changed and were written back.
    pub rewritten: Vec<PathBuf>,
}

/// Rewrite the index URL in every intermediate file under `dir`.
///
/// Files whose contents would not change are left untouched, so running this
/// twice with the same port rewrites nothing the second time.
pub fn fix_up_intermediate_files(dir: &Path, port: u16) -> Result<FixupSummary> {
    let dir_pattern = glob::Pattern::escape(
        dir.to_str()
            .with_context(|| format!("scratch directory {} is not valid UTF-8", dir.display()))?,
    );
    let pattern = format!("{dir_pattern}/{INTERMEDIATE_FILE_PATTERN}");

    let mut summary = FixupSummary::default();
    let paths = glob::glob(&pattern).with_context(|| format!("invalid glob pattern {pattern}"))?;

    for entry in paths {
        let path = entry.context("failed to read scratch directory entry")?;
        summary.matched += 1;

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let rewritten = rewrite_index_urls(&text, port);
        if rewritten == text {
            debug!(path = %path.display(), "intermediate file already up to date");
            continue;
        }

        std::fs::write(&path, rewritten.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
        summary.rewritten.push(path);
    }

    info!(
        port,
        matched = summary.matched,
        rewritten = summary.rewritten.len(),
        "updated intermediate files"
    );
    Ok(summary)
}
