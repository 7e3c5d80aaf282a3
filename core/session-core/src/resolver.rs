//! Per-request session restoration.
//!
//! The resolver decides whether a request can reuse a stored automation
//! session for its identity key. It never authenticates, never writes to the
//! store, and never fails: every problem degrades to "not restored" so the
//! request continues to the next authentication layer.

use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::annotation::RequestAnnotation;
use crate::error::StoreError;
use crate::monitor::StoreHealthMonitor;
use crate::store::SessionLookup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotRestoredReason {
    StoreUnavailable,
    NotFound,
    LookupError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored {
        identity_key: String,
    },
    /// `reason` is `None` when the request carried no identity at all.
    NotRestored {
        reason: Option<NotRestoredReason>,
    },
}

impl RestoreOutcome {
    pub fn restored(&self) -> bool {
        matches!(self, RestoreOutcome::Restored { .. })
    }

    pub fn reason(&self) -> Option<NotRestoredReason> {
        match self {
            RestoreOutcome::Restored { .. } => None,
            RestoreOutcome::NotRestored { reason } => *reason,
        }
    }

    pub fn identity_key(&self) -> Option<&str> {
        match self {
            RestoreOutcome::Restored { identity_key } => Some(identity_key),
            RestoreOutcome::NotRestored { .. } => None,
        }
    }

    fn skipped(reason: NotRestoredReason) -> Self {
        RestoreOutcome::NotRestored {
            reason: Some(reason),
        }
    }
}

impl Serialize for RestoreOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            restored: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            identity_key: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            reason: Option<NotRestoredReason>,
        }

        Wire {
            restored: self.restored(),
            identity_key: self.identity_key(),
            reason: self.reason(),
        }
        .serialize(serializer)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    pub restored: u64,
    pub missing_identity: u64,
    pub store_unavailable: u64,
    pub not_found: u64,
    pub lookup_error: u64,
}

#[derive(Default)]
struct Counters {
    restored: AtomicU64,
    missing_identity: AtomicU64,
    store_unavailable: AtomicU64,
    not_found: AtomicU64,
    lookup_error: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &RestoreOutcome) {
        let counter = match outcome {
            RestoreOutcome::Restored { .. } => &self.restored,
            RestoreOutcome::NotRestored { reason: None } => &self.missing_identity,
            RestoreOutcome::NotRestored {
                reason: Some(NotRestoredReason::StoreUnavailable),
            } => &self.store_unavailable,
            RestoreOutcome::NotRestored {
                reason: Some(NotRestoredReason::NotFound),
            } => &self.not_found,
            RestoreOutcome::NotRestored {
                reason: Some(NotRestoredReason::LookupError),
            } => &self.lookup_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ResolverStats {
        ResolverStats {
            restored: self.restored.load(Ordering::Relaxed),
            missing_identity: self.missing_identity.load(Ordering::Relaxed),
            store_unavailable: self.store_unavailable.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            lookup_error: self.lookup_error.load(Ordering::Relaxed),
        }
    }
}

pub struct SessionResolver {
    monitor: Arc<StoreHealthMonitor>,
    lookup: Arc<dyn SessionLookup>,
    counters: Counters,
}

impl SessionResolver {
    pub fn new(monitor: Arc<StoreHealthMonitor>, lookup: Arc<dyn SessionLookup>) -> Self {
        Self {
            monitor,
            lookup,
            counters: Counters::default(),
        }
    }

    /// Decides whether the session for `identity_key` can be reused.
    pub fn resolve(&self, identity_key: Option<&str>) -> RestoreOutcome {
        let outcome = self.resolve_inner(identity_key);
        self.counters.record(&outcome);
        outcome
    }

    /// Pipeline hook: resolves once and returns the request's annotation.
    pub fn auto_restore(&self, identity_key: Option<&str>) -> RequestAnnotation {
        let mut annotation = RequestAnnotation::new();
        if let RestoreOutcome::Restored { identity_key } = self.resolve(identity_key) {
            annotation.mark_restored(&identity_key);
        }
        annotation
    }

    pub fn stats(&self) -> ResolverStats {
        self.counters.snapshot()
    }

    fn resolve_inner(&self, identity_key: Option<&str>) -> RestoreOutcome {
        // Blank means anonymous; anything else is looked up verbatim.
        let key = match identity_key.filter(|key| !key.trim().is_empty()) {
            Some(key) => key,
            None => return RestoreOutcome::NotRestored { reason: None },
        };

        if !self.monitor.is_healthy() {
            debug!(
                identity_key = %key,
                state = %self.monitor.current_state(),
                "Store unavailable; skipping session restore"
            );
            return RestoreOutcome::skipped(NotRestoredReason::StoreUnavailable);
        }

        let lookup = panic::catch_unwind(AssertUnwindSafe(|| {
            self.lookup.find_session_by_identity(key)
        }))
        .unwrap_or_else(|_| {
            Err(StoreError::MalformedRecord {
                identity_key: key.to_string(),
                details: "store driver panicked during lookup".to_string(),
            })
        });

        match lookup {
            Ok(Some(record)) if record.identity_key == key => {
                debug!(identity_key = %key, "Session restored");
                RestoreOutcome::Restored {
                    identity_key: record.identity_key,
                }
            }
            Ok(Some(record)) => {
                warn!(
                    identity_key = %key,
                    record_identity = %record.identity_key,
                    "Store returned a record for a different identity"
                );
                RestoreOutcome::skipped(NotRestoredReason::LookupError)
            }
            Ok(None) => {
                debug!(identity_key = %key, "No stored session");
                RestoreOutcome::skipped(NotRestoredReason::NotFound)
            }
            Err(err) => {
                warn!(
                    identity_key = %key,
                    error = %err,
                    category = err.category(),
                    "Session lookup failed; continuing unauthenticated"
                );
                RestoreOutcome::skipped(NotRestoredReason::LookupError)
            }
        }
    }
}
