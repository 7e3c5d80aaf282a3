//! Session store seam and its SQLite implementation.
//!
//! The resolver only ever holds a [`SessionLookup`]; opening and closing the
//! handle is reserved for the health monitor through [`SessionStore`].
//! Uniqueness of one record per identity key is the table's primary key.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use fs_err as fs;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::config::StoreUri;
use crate::error::{Result, StoreError};

/// Default validity window for a stored session, measured from `last_validated_at`.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub identity_key: String,
    /// Opaque cookies/tokens needed to resume automation without a login.
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub size_bytes: u64,
    pub collection_count: u64,
    pub session_count: u64,
}

/// Read-only access used by the session resolver.
pub trait SessionLookup: Send + Sync {
    fn find_session_by_identity(&self, identity_key: &str) -> Result<Option<SessionRecord>>;
}

/// Full store driver, owned by the health monitor.
pub trait SessionStore: SessionLookup {
    fn connect(&self, uri: &StoreUri) -> Result<()>;

    /// Releases the handle. Must be safe to call when nothing is open.
    fn disconnect(&self) -> Result<()>;

    fn ping(&self) -> Result<()>;

    fn stats(&self) -> Result<StoreStats>;

    fn list_collections(&self) -> Result<Vec<String>>;
}

struct OpenStore {
    conn: Connection,
    path: Option<PathBuf>,
}

pub struct SqliteStore {
    handle: Mutex<Option<OpenStore>>,
    ttl: Option<Duration>,
}

impl Default for SqliteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteStore {
    pub fn new() -> Self {
        Self::with_ttl(Some(Duration::seconds(DEFAULT_SESSION_TTL_SECS)))
    }

    /// `None` disables expiry entirely.
    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            handle: Mutex::new(None),
            ttl,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Stores a session after a fresh login, or refreshes an existing one.
    /// `created_at` survives the upsert; `last_validated_at` is bumped.
    pub fn save_session(&self, identity_key: &str, payload: &str) -> Result<SessionRecord> {
        self.save_session_at(identity_key, payload, Utc::now())
    }

    fn save_session_at(
        &self,
        identity_key: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionRecord> {
        let stamp = format_timestamp(now);
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions (identity_key, payload, created_at, last_validated_at) \
                 VALUES (?1, ?2, ?3, ?3) \
                 ON CONFLICT(identity_key) DO UPDATE SET \
                    payload = excluded.payload, \
                    last_validated_at = excluded.last_validated_at",
                params![identity_key, payload, stamp],
            )
            .map_err(|source| StoreError::Lookup {
                context: "Failed to upsert session".to_string(),
                source,
            })?;
            Ok(())
        })?;

        self.load_session(identity_key)?
            .ok_or_else(|| StoreError::MalformedRecord {
                identity_key: identity_key.to_string(),
                details: "row missing after upsert".to_string(),
            })
    }

    /// Returns whether a record was removed.
    pub fn delete_session(&self, identity_key: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM sessions WHERE identity_key = ?1",
                    params![identity_key],
                )
                .map_err(|source| StoreError::Lookup {
                    context: "Failed to delete session".to_string(),
                    source,
                })?;
            Ok(removed > 0)
        })
    }

    /// Deletes every record older than the TTL. Returns the number removed.
    pub fn prune_expired(&self) -> Result<u64> {
        self.prune_expired_at(Utc::now())
    }

    fn prune_expired_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let ttl = match self.ttl {
            Some(ttl) => ttl,
            None => return Ok(0),
        };
        // A TTL reaching past the representable range never expires anything.
        let cutoff = match now.checked_sub_signed(ttl) {
            Some(cutoff) => format_timestamp(cutoff),
            None => return Ok(0),
        };
        self.with_connection(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM sessions WHERE last_validated_at < ?1",
                    params![cutoff],
                )
                .map_err(|source| StoreError::Lookup {
                    context: "Failed to prune expired sessions".to_string(),
                    source,
                })?;
            Ok(removed as u64)
        })
    }

    fn find_session_at(
        &self,
        identity_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>> {
        let record = match self.load_session(identity_key)? {
            Some(record) => record,
            None => return Ok(None),
        };

        if let Some(ttl) = self.ttl {
            let expired = record
                .last_validated_at
                .checked_add_signed(ttl)
                .is_some_and(|expires_at| expires_at < now);
            if expired {
                debug!(
                    identity_key = %identity_key,
                    last_validated_at = %record.last_validated_at.to_rfc3339(),
                    "Session record expired"
                );
                return Ok(None);
            }
        }

        Ok(Some(record))
    }

    fn load_session(&self, identity_key: &str) -> Result<Option<SessionRecord>> {
        let row = self.with_connection(|conn| {
            conn.query_row(
                "SELECT identity_key, payload, created_at, last_validated_at \
                 FROM sessions WHERE identity_key = ?1",
                params![identity_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|source| StoreError::Lookup {
                context: "Failed to query session".to_string(),
                source,
            })
        })?;

        let (key, payload, created_at, last_validated_at) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        Ok(Some(SessionRecord {
            created_at: parse_timestamp(&key, "created_at", &created_at)?,
            last_validated_at: parse_timestamp(&key, "last_validated_at", &last_validated_at)?,
            identity_key: key,
            payload,
        }))
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.lock_handle();
        match guard.as_ref() {
            Some(open) => op(&open.conn),
            None => Err(StoreError::NotConnected),
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<OpenStore>> {
        // A poisoned lock only means a panic happened mid-query; the
        // connection itself is still usable.
        self.handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionLookup for SqliteStore {
    fn find_session_by_identity(&self, identity_key: &str) -> Result<Option<SessionRecord>> {
        self.find_session_at(identity_key, Utc::now())
    }
}

impl SessionStore for SqliteStore {
    fn connect(&self, uri: &StoreUri) -> Result<()> {
        let open = open_store(uri)?;
        let previous = self.lock_handle().replace(open);
        if let Some(previous) = previous {
            // Reconnect after a loss: the stale handle is dropped here.
            let _ = previous.conn.close();
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let open = match self.lock_handle().take() {
            Some(open) => open,
            None => return Ok(()),
        };
        open.conn
            .close()
            .map_err(|(_, source)| StoreError::Shutdown { source })
    }

    fn ping(&self) -> Result<()> {
        let guard = self.lock_handle();
        let open = guard.as_ref().ok_or(StoreError::NotConnected)?;

        if let Some(path) = &open.path {
            if !path.exists() {
                return Err(StoreError::Ping(format!(
                    "database file missing: {}",
                    path.display()
                )));
            }
        }

        open.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|err| StoreError::Ping(err.to_string()))
    }

    fn stats(&self) -> Result<StoreStats> {
        self.with_connection(|conn| {
            let query = |sql: &str| {
                conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                    .map_err(|source| StoreError::Lookup {
                        context: format!("Failed to read store stats ({})", sql),
                        source,
                    })
            };
            let page_count = query("PRAGMA page_count")?;
            let page_size = query("PRAGMA page_size")?;
            let collection_count = query(
                "SELECT COUNT(*) FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )?;
            let session_count = query("SELECT COUNT(*) FROM sessions")?;

            Ok(StoreStats {
                size_bytes: (page_count.max(0) as u64).saturating_mul(page_size.max(0) as u64),
                collection_count: collection_count.max(0) as u64,
                session_count: session_count.max(0) as u64,
            })
        })
    }

    fn list_collections(&self) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                )
                .map_err(|source| StoreError::Lookup {
                    context: "Failed to prepare collections query".to_string(),
                    source,
                })?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|source| StoreError::Lookup {
                    context: "Failed to list collections".to_string(),
                    source,
                })?;

            let mut names = Vec::new();
            for row in rows {
                names.push(row.map_err(|source| StoreError::Lookup {
                    context: "Failed to decode collection row".to_string(),
                    source,
                })?);
            }
            Ok(names)
        })
    }
}

fn open_store(uri: &StoreUri) -> Result<OpenStore> {
    let connection_error = |source| StoreError::Connection {
        uri: uri.to_string(),
        source,
    };

    let (conn, path) = match uri {
        StoreUri::Memory => (Connection::open_in_memory().map_err(connection_error)?, None),
        StoreUri::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    context: format!("Failed to create store directory {}", parent.display()),
                    source,
                })?;
            }
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
            let conn = Connection::open_with_flags(path, flags).map_err(connection_error)?;
            (conn, Some(path.clone()))
        }
    };

    conn.pragma_update(None, "busy_timeout", 5000)
        .map_err(connection_error)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            identity_key TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_validated_at TEXT NOT NULL
         );",
    )
    .map_err(connection_error)?;

    Ok(OpenStore { conn, path })
}

// Fixed-width UTC so that stored values order lexicographically.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(identity_key: &str, field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::MalformedRecord {
            identity_key: identity_key.to_string(),
            details: format!("{} is not RFC3339 ({}): {}", field, value, err),
        })
}
