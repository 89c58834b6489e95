//! Marker detection over captured server output.
//!
//! Both predicates are plain substring tests against the full accumulated
//! text of one stream. There is no cursor: every call rescans the whole
//! snapshot, so a marker split across two reads of the same pipe is still
//! found once both halves have arrived.

/// Banner pypiserver prints once its listener is bound.
pub const READY_MARKER: &str = "Hit Ctrl-C to quit";

/// Text the server emits when the requested port is already bound.
pub const CONFLICT_MARKER: &str = "Address already in use";

/// Looks for the ready and port-conflict markers in server output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessDetector {
    ready_marker: String,
    conflict_marker: String,
}

impl ReadinessDetector {
    /// Create a detector with custom markers.
    pub fn new(ready_marker: impl Into<String>, conflict_marker: impl Into<String>) -> Self {
        Self {
            ready_marker: ready_marker.into(),
            conflict_marker: conflict_marker.into(),
        }
    }

    /// Return `true` once `snapshot` contains the ready marker.
    pub fn check_ready(&self, snapshot: &str) -> bool {
        snapshot.contains(&self.ready_marker)
    }

    /// Return `true` once `snapshot` contains the port-conflict marker.
    pub fn check_port_conflict(&self, snapshot: &str) -> bool {
        snapshot.contains(&self.conflict_marker)
    }
}

impl Default for ReadinessDetector {
    fn default() -> Self {
        Self::new(READY_MARKER, CONFLICT_MARKER)
    }
}
