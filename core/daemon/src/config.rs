//! Daemon tunables loaded from `~/.sessiond/config.toml`.
//!
//! A missing file means defaults. The store URI here is only a fallback:
//! `--store-uri` and `SESSIOND_STORE_URI` both take precedence.

use serde::Deserialize;
use std::path::PathBuf;

use session_core::DEFAULT_SESSION_TTL_SECS;

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub store_uri: Option<String>,
    /// Validity window for stored sessions; `0` disables expiry.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_uri: None,
            session_ttl_secs: default_session_ttl_secs(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl DaemonConfig {
    pub fn session_ttl(&self) -> Option<chrono::Duration> {
        if self.session_ttl_secs == 0 {
            return None;
        }
        i64::try_from(self.session_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }

    pub fn probe_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

pub fn default_config_path() -> Result<PathBuf, String> {
    session_core::sessiond_dir()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .ok_or_else(|| "Home directory not found".to_string())
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read daemon config {}: {}",
            config_path.display(),
            err
        )
    })?;
    toml::from_str::<DaemonConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse daemon config {}: {}",
            config_path.display(),
            err
        )
    })
}

fn default_session_ttl_secs() -> u64 {
    DEFAULT_SESSION_TTL_SECS as u64
}

fn default_probe_interval_secs() -> u64 {
    15
}
