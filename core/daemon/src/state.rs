//! Process-wide state shared by connection handlers.
//!
//! Built once by the bootstrap: one store, one monitor, one resolver. The
//! store handle is opened and closed only through the monitor.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use session_core::{SessionResolver, SqliteStore, StateChange, StoreHealthMonitor};

const RECENT_TRANSITIONS: usize = 16;

pub struct SharedState {
    pub store: Arc<SqliteStore>,
    pub monitor: Arc<StoreHealthMonitor>,
    pub resolver: SessionResolver,
    pub store_uri: String,
    transitions: Arc<Mutex<VecDeque<StateChange>>>,
    active_connections: AtomicUsize,
    rejected_connections: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecuritySnapshot {
    pub active_connections: usize,
    pub rejected_connections: u64,
    pub max_active_connections: usize,
}

/// Held for the lifetime of one accepted connection.
pub struct ConnectionPermit {
    state: Arc<SharedState>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SharedState {
    pub fn new(store: Arc<SqliteStore>, store_uri: impl Into<String>) -> Self {
        let monitor = Arc::new(StoreHealthMonitor::new(store.clone()));
        let resolver = SessionResolver::new(Arc::clone(&monitor), store.clone());
        let transitions = Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_TRANSITIONS)));

        let log = Arc::clone(&transitions);
        monitor.on_state_change(move |change| {
            tracing::info!(
                from = %change.from,
                to = %change.to,
                cause = ?change.cause,
                "Store connection state changed"
            );
            let mut log = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if log.len() == RECENT_TRANSITIONS {
                log.pop_front();
            }
            log.push_back(change.clone());
        });

        Self {
            store,
            monitor,
            resolver,
            store_uri: store_uri.into(),
            transitions,
            active_connections: AtomicUsize::new(0),
            rejected_connections: AtomicU64::new(0),
        }
    }

    /// Returns `None` (and counts a rejection) when `max` connections are open.
    pub fn try_acquire_connection(self: &Arc<Self>, max: usize) -> Option<ConnectionPermit> {
        let acquired = self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < max).then_some(active + 1)
            })
            .is_ok();

        if acquired {
            Some(ConnectionPermit {
                state: Arc::clone(self),
            })
        } else {
            self.rejected_connections.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    pub fn security_snapshot(&self, max: usize) -> SecuritySnapshot {
        SecuritySnapshot {
            active_connections: self.active_connections.load(Ordering::SeqCst),
            rejected_connections: self.rejected_connections.load(Ordering::SeqCst),
            max_active_connections: max,
        }
    }

    pub fn recent_transitions(&self) -> Vec<StateChange> {
        self.transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
