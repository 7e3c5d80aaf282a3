//! Per-request restoration marker handed to downstream handlers.

use serde::Serialize;

/// Write-once: once a session is marked restored it stays restored for the
/// lifetime of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestAnnotation {
    session_restored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    identity_key: Option<String>,
}

impl RequestAnnotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` (and changes nothing) if already marked.
    pub fn mark_restored(&mut self, identity_key: &str) -> bool {
        if self.session_restored {
            return false;
        }
        self.session_restored = true;
        self.identity_key = Some(identity_key.to_string());
        true
    }

    pub fn session_restored(&self) -> bool {
        self.session_restored
    }

    /// Present only when `session_restored()` is true.
    pub fn identity_key(&self) -> Option<&str> {
        self.identity_key.as_deref()
    }
}
