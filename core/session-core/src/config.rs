//! Store URI parsing and resolution.
//!
//! The core takes exactly one tunable: the connection URI. It comes from an
//! explicit argument when the caller has one, otherwise from the
//! `SESSIOND_STORE_URI` environment variable, otherwise from the default
//! database under `~/.sessiond/`.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

pub const STORE_URI_ENV: &str = "SESSIOND_STORE_URI";

const SQLITE_SCHEME: &str = "sqlite:";
const MEMORY_URI: &str = "sqlite::memory:";
const DEFAULT_DB_NAME: &str = "sessions.db";

/// Location of the backing session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUri {
    /// On-disk SQLite database.
    File(PathBuf),
    /// Private in-memory database; lost on disconnect.
    Memory,
}

impl StoreUri {
    /// Parses `sqlite://<path>`, `sqlite:<path>`, `sqlite::memory:` or a bare path.
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(StoreError::InvalidUri(value.to_string()));
        }
        if trimmed == MEMORY_URI {
            return Ok(StoreUri::Memory);
        }

        if let Some(rest) = trimmed.strip_prefix(SQLITE_SCHEME) {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(StoreError::InvalidUri(value.to_string()));
            }
            return Ok(StoreUri::File(expand_home(path)));
        }

        // Anything else carrying a scheme is a store we cannot drive.
        if let Some((scheme, _)) = trimmed.split_once("://") {
            if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
                return Err(StoreError::InvalidUri(value.to_string()));
            }
        }

        Ok(StoreUri::File(expand_home(trimmed)))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            StoreUri::File(path) => Some(path.as_path()),
            StoreUri::Memory => None,
        }
    }
}

impl fmt::Display for StoreUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreUri::File(path) => write!(f, "sqlite://{}", path.display()),
            StoreUri::Memory => f.write_str(MEMORY_URI),
        }
    }
}

/// Returns the state directory (`~/.sessiond`).
pub fn sessiond_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".sessiond"))
}

/// Returns the default database location.
pub fn default_store_uri() -> Result<StoreUri> {
    sessiond_dir()
        .map(|dir| StoreUri::File(dir.join(DEFAULT_DB_NAME)))
        .ok_or(StoreError::Config {
            path: PathBuf::from("~"),
            details: "Home directory not found".to_string(),
        })
}

/// Resolves the store URI: explicit argument, then environment, then default.
pub fn resolve_store_uri(explicit: Option<&str>) -> Result<StoreUri> {
    resolve_store_uri_or(explicit, None)
}

/// Like [`resolve_store_uri`], with a configured value (e.g. from a config
/// file) consulted after the environment and before the default.
pub fn resolve_store_uri_or(explicit: Option<&str>, configured: Option<&str>) -> Result<StoreUri> {
    let env_value = env::var(STORE_URI_ENV).ok();
    resolve_store_uri_from(explicit, env_value.as_deref(), configured)
}

fn resolve_store_uri_from(
    explicit: Option<&str>,
    env_value: Option<&str>,
    configured: Option<&str>,
) -> Result<StoreUri> {
    let present = |value: &&str| !value.trim().is_empty();
    let chosen = explicit
        .filter(present)
        .or_else(|| env_value.filter(present))
        .or_else(|| configured.filter(present));

    match chosen {
        Some(value) => StoreUri::parse(value),
        None => default_store_uri(),
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_forms() {
        assert_eq!(
            StoreUri::parse("sqlite:///var/lib/sessions.db").unwrap(),
            StoreUri::File(PathBuf::from("/var/lib/sessions.db"))
        );
        assert_eq!(
            StoreUri::parse("sqlite:data/sessions.db").unwrap(),
            StoreUri::File(PathBuf::from("data/sessions.db"))
        );
        assert_eq!(
            StoreUri::parse("sqlite::memory:").unwrap(),
            StoreUri::Memory
        );
        assert_eq!(
            StoreUri::parse("/tmp/sessions.db").unwrap(),
            StoreUri::File(PathBuf::from("/tmp/sessions.db"))
        );
    }

    #[test]
    fn rejects_foreign_schemes_and_blank_values() {
        assert!(matches!(
            StoreUri::parse("mongodb://localhost:27017/bot"),
            Err(StoreError::InvalidUri(_))
        ));
        assert!(matches!(StoreUri::parse("  "), Err(StoreError::InvalidUri(_))));
        assert!(matches!(
            StoreUri::parse("sqlite://"),
            Err(StoreError::InvalidUri(_))
        ));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let uri = StoreUri::File(PathBuf::from("/tmp/a.db"));
        assert_eq!(uri.to_string(), "sqlite:///tmp/a.db");
        assert_eq!(StoreUri::parse(&uri.to_string()).unwrap(), uri);
        assert_eq!(StoreUri::Memory.to_string(), "sqlite::memory:");
    }

    #[test]
    fn explicit_argument_wins_over_environment() {
        let uri = resolve_store_uri_from(
            Some("/tmp/explicit.db"),
            Some("/tmp/env.db"),
            Some("/tmp/file.db"),
        )
        .unwrap();
        assert_eq!(uri, StoreUri::File(PathBuf::from("/tmp/explicit.db")));
    }

    #[test]
    fn environment_used_when_argument_blank() {
        let uri = resolve_store_uri_from(Some(""), Some("sqlite::memory:"), Some("/tmp/file.db"))
            .unwrap();
        assert_eq!(uri, StoreUri::Memory);
    }

    #[test]
    fn configured_value_used_before_default() {
        let uri = resolve_store_uri_from(None, None, Some("/tmp/file.db")).unwrap();
        assert_eq!(uri, StoreUri::File(PathBuf::from("/tmp/file.db")));
    }

    #[test]
    fn falls_back_to_default_location() {
        let uri = resolve_store_uri_from(None, None, None).unwrap();
        let path = uri.path().expect("default is file backed");
        assert!(path.ends_with(".sessiond/sessions.db"));
    }
}
