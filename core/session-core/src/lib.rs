//! # session-core
//!
//! Session validity tracking and auto-restore for the automation backend.
//!
//! Two pieces, composed per request:
//!
//! - [`StoreHealthMonitor`] tracks whether the session store can serve reads
//!   and writes right now, and is the only owner of the store handle.
//! - [`SessionResolver`] takes the identity key of an inbound request and
//!   decides whether a stored automation session can be reused.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Store calls block the
//!   calling thread; health queries never do.
//! - **Fail-open**: Nothing here turns a store problem into a request error.
//!   A request that cannot be restored is simply unauthenticated.
//! - **Explicit ownership**: The monitor is an `Arc` created by the process
//!   bootstrap, not a global.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use session_core::{SessionResolver, SqliteStore, StoreHealthMonitor};
//!
//! let store = Arc::new(SqliteStore::new());
//! let monitor = Arc::new(StoreHealthMonitor::new(store.clone()));
//! monitor.connect("sqlite:///var/lib/bot/sessions.db");
//!
//! let resolver = SessionResolver::new(monitor.clone(), store);
//! let annotation = resolver.auto_restore(Some("alice"));
//! ```

pub mod annotation;
pub mod config;
pub mod error;
pub mod monitor;
pub mod resolver;
pub mod store;

pub use annotation::RequestAnnotation;
pub use config::{resolve_store_uri, resolve_store_uri_or, sessiond_dir, StoreUri, STORE_URI_ENV};
pub use error::{Result, StoreError};
pub use monitor::{
    ConnectionState, ShutdownGuard, StateChange, StoreHealthMonitor, TransitionCause,
};
pub use resolver::{NotRestoredReason, ResolverStats, RestoreOutcome, SessionResolver};
pub use store::{
    SessionLookup, SessionRecord, SessionStore, SqliteStore, StoreStats,
    DEFAULT_SESSION_TTL_SECS,
};
