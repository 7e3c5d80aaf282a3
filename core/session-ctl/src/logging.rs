//! File logging for sessionctl.
//!
//! Writes `~/.sessiond/sessionctl.{date}.log` with daily rotation, keeping
//! seven files. `RUST_LOG` overrides the default filter. Falls back to
//! stderr when the appender cannot be created.

use fs_err as fs;
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_PREFIX: &str = "sessionctl";
const MAX_LOG_FILES: usize = 7;

pub fn init() {
    let log_dir = session_core::sessiond_dir().unwrap_or_else(|| PathBuf::from("."));
    let _ = fs::create_dir_all(&log_dir);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sessionctl=debug,session_core=warn"));

    match create_file_appender(&log_dir) {
        Ok(file_appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Short-lived process: keep the worker alive until exit.
            std::mem::forget(guard);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_timer(fmt::time::UtcTime::rfc_3339())
                        .with_ansi(false),
                )
                .init();
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_timer(fmt::time::UtcTime::rfc_3339())
                        .with_ansi(true),
                )
                .init();
        }
    }
}

fn create_file_appender(log_dir: &Path) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)
}
