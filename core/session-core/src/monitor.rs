//! Connection-health state machine for the session store.
//!
//! One monitor exists per process. It is the only component allowed to open
//! or close the store handle; everything else asks it whether the store is
//! usable right now.
//!
//! ```text
//!              connect()                  ok
//! DISCONNECTED ─────────▶ CONNECTING ─────────▶ CONNECTED
//!      ▲  ▲                   │ failed             │  │
//!      │  └───────────────────┘                    │  │ disconnect()
//!      │ ◀──────────── connection lost ────────────┘  ▼
//!      │ ────────────── reconnected ─────────▶   DISCONNECTING
//!      └──────────────────────────────────────────────┘
//! ```
//!
//! Lifecycle operations (`connect`, `disconnect`, `probe`,
//! `report_connection_lost`) are serialized, so listeners observe transitions
//! in the order they happened. Listeners run on the thread that caused the
//! transition and must not call lifecycle operations themselves.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::config::StoreUri;
use crate::error::{Result, StoreError};
use crate::store::{SessionStore, StoreStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
        }
    }

    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Connected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed,
    ConnectionLost,
    Reconnected,
    DisconnectRequested,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: DateTime<Utc>,
    pub cause: TransitionCause,
}

type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

struct Status {
    state: ConnectionState,
    last_transition_at: DateTime<Utc>,
}

#[derive(Default)]
struct Lifecycle {
    /// Last URI that connected successfully; used for reconnection.
    uri: Option<StoreUri>,
    /// Set only by an unsolicited loss. Gates automatic reconnection.
    lost: bool,
}

pub struct StoreHealthMonitor {
    store: Arc<dyn SessionStore>,
    status: RwLock<Status>,
    lifecycle: Mutex<Lifecycle>,
    listeners: Mutex<Vec<Listener>>,
}

impl StoreHealthMonitor {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            status: RwLock::new(Status {
                state: ConnectionState::Disconnected,
                last_transition_at: Utc::now(),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Parses `uri` and connects. An unparseable URI is a failed attempt.
    pub fn connect(&self, uri: &str) -> bool {
        match StoreUri::parse(uri) {
            Ok(parsed) => self.connect_uri(&parsed),
            Err(err) => {
                let _lifecycle = self.lock_lifecycle();
                if self.current_state() == ConnectionState::Connected {
                    warn!(
                        error = %err,
                        category = err.category(),
                        "Rejected invalid store URI; existing connection kept"
                    );
                    return false;
                }
                self.transition(ConnectionState::Connecting, TransitionCause::ConnectRequested);
                warn!(error = %err, category = err.category(), "Store connection failed");
                self.transition(ConnectionState::Disconnected, TransitionCause::ConnectFailed);
                false
            }
        }
    }

    /// Opens the store. Failures are logged and reported as `false`; the
    /// monitor never retries a failed attempt on its own.
    pub fn connect_uri(&self, uri: &StoreUri) -> bool {
        let mut lifecycle = self.lock_lifecycle();
        if self.current_state() == ConnectionState::Connected {
            debug!(uri = %uri, "Store already connected");
            return true;
        }

        self.transition(ConnectionState::Connecting, TransitionCause::ConnectRequested);
        lifecycle.lost = false;

        match guarded("connect", || self.store.connect(uri)) {
            Ok(()) => {
                lifecycle.uri = Some(uri.clone());
                self.transition(ConnectionState::Connected, TransitionCause::ConnectSucceeded);
                info!(uri = %uri, "Store connected");
                true
            }
            Err(err) => {
                warn!(
                    uri = %uri,
                    error = %err,
                    category = err.category(),
                    "Store connection failed"
                );
                self.transition(ConnectionState::Disconnected, TransitionCause::ConnectFailed);
                false
            }
        }
    }

    /// Releases the store handle. Idempotent; a failing release is logged
    /// and the state still ends at `DISCONNECTED`.
    pub fn disconnect(&self) {
        let mut lifecycle = self.lock_lifecycle();
        lifecycle.lost = false;

        if self.current_state() != ConnectionState::Connected {
            // A lost connection may still hold a handle.
            if let Err(err) = guarded("disconnect", || self.store.disconnect()) {
                warn!(error = %err, "Failed to release stale store handle");
            }
            debug!(state = %self.current_state(), "Store already disconnected");
            return;
        }

        self.transition(
            ConnectionState::Disconnecting,
            TransitionCause::DisconnectRequested,
        );
        if let Err(err) = guarded("disconnect", || self.store.disconnect()) {
            warn!(error = %err, category = err.category(), "Store shutdown failed");
        }
        self.transition(ConnectionState::Disconnected, TransitionCause::Disconnected);
        info!("Store disconnected");
    }

    /// Liveness check. A failed ping while connected counts as an
    /// unsolicited loss; after such a loss the last URI is reopened.
    pub fn probe(&self) -> ConnectionState {
        let mut lifecycle = self.lock_lifecycle();

        match self.current_state() {
            ConnectionState::Connected => {
                if let Err(err) = guarded("ping", || self.store.ping()) {
                    warn!(error = %err, "Store ping failed; marking connection lost");
                    lifecycle.lost = true;
                    self.transition(ConnectionState::Disconnected, TransitionCause::ConnectionLost);
                }
            }
            ConnectionState::Disconnected if lifecycle.lost => {
                if let Some(uri) = lifecycle.uri.clone() {
                    match guarded("connect", || self.store.connect(&uri)) {
                        Ok(()) => {
                            lifecycle.lost = false;
                            self.transition(
                                ConnectionState::Connected,
                                TransitionCause::Reconnected,
                            );
                            info!(uri = %uri, "Store reconnected");
                        }
                        Err(err) => {
                            debug!(uri = %uri, error = %err, "Store reconnect attempt failed");
                        }
                    }
                }
            }
            _ => {}
        }

        self.current_state()
    }

    /// Entry point for a driver that notices the connection dropped.
    pub fn report_connection_lost(&self, cause: &str) {
        let mut lifecycle = self.lock_lifecycle();
        if self.current_state() != ConnectionState::Connected {
            return;
        }
        warn!(cause = %cause, "Store connection lost");
        lifecycle.lost = true;
        self.transition(ConnectionState::Disconnected, TransitionCause::ConnectionLost);
    }

    pub fn is_healthy(&self) -> bool {
        self.current_state() == ConnectionState::Connected
    }

    pub fn current_state(&self) -> ConnectionState {
        self.read_status().state
    }

    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.read_status().last_transition_at
    }

    /// Registers a callback for every transition. Callbacks run in
    /// registration order; a panicking callback is logged and skipped.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(listener));
    }

    /// Channel view of the transition stream.
    pub fn subscribe(&self) -> mpsc::Receiver<StateChange> {
        let (tx, rx) = mpsc::channel();
        self.on_state_change(move |change| {
            let _ = tx.send(change.clone());
        });
        rx
    }

    /// Returns a guard that disconnects exactly once, at the latest on drop.
    pub fn shutdown_guard(self: &Arc<Self>) -> ShutdownGuard {
        ShutdownGuard {
            monitor: Arc::clone(self),
            released: AtomicBool::new(false),
        }
    }

    // Diagnostic read-throughs.

    pub fn ping(&self) -> Result<()> {
        self.require_healthy()?;
        guarded("ping", || self.store.ping())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.require_healthy()?;
        guarded("stats", || self.store.stats())
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        self.require_healthy()?;
        guarded("list_collections", || self.store.list_collections())
    }

    fn require_healthy(&self) -> Result<()> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }

    fn transition(&self, to: ConnectionState, cause: TransitionCause) {
        let change = {
            let mut status = self
                .status
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let from = status.state;
            if !from.can_transition_to(to) {
                warn!(from = %from, to = %to, cause = ?cause, "Rejected invalid state transition");
                return;
            }
            let at = Utc::now();
            status.state = to;
            status.last_transition_at = at;
            StateChange {
                from,
                to,
                at,
                cause,
            }
        };

        debug!(
            from = %change.from,
            to = %change.to,
            cause = ?change.cause,
            "Store state transition"
        );
        self.notify(&change);
    }

    fn notify(&self, change: &StateChange) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for (index, listener) in listeners.iter().enumerate() {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
                warn!(listener = index, to = %change.to, "State change listener panicked");
            }
        }
    }

    fn read_status(&self) -> std::sync::RwLockReadGuard<'_, Status> {
        self.status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Scoped release of the store connection.
pub struct ShutdownGuard {
    monitor: Arc<StoreHealthMonitor>,
    released: AtomicBool,
}

impl ShutdownGuard {
    /// Disconnects on the first call; later calls (and the drop) do nothing.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.monitor.disconnect();
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Runs a store call, turning a driver panic into an error naming `operation`.
fn guarded<T>(operation: &'static str, op: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(op))
        .unwrap_or_else(|_| Err(StoreError::DriverPanic { operation }))
}
