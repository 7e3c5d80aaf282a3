//! sessiond entrypoint.
//!
//! A small local service that owns the session store connection for the
//! automation backend. The HTTP layer calls `auto_restore` over the socket
//! before its route handlers run; operators use the diagnostic methods.

use clap::Parser;
use fs_err as fs;
use std::env;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use session_core::{resolve_store_uri_or, SqliteStore, StoreError};
use sessiond_protocol::{Response, ERROR_TOO_MANY_CONNECTIONS};

mod config;
mod handlers;
mod ipc;
mod probe;
mod shutdown;
mod state;

use handlers::MAX_ACTIVE_CONNECTIONS;
use state::{ConnectionPermit, SharedState};

const SOCKET_ENV: &str = "SESSIOND_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const ACCEPT_POLL_MS: u64 = 50;

#[derive(Parser)]
#[command(name = "sessiond")]
#[command(about = "Session store owner and auto-restore hook")]
#[command(version)]
struct Cli {
    /// Store connection URI (overrides SESSIOND_STORE_URI and config.toml)
    #[arg(long, value_name = "URI")]
    store_uri: Option<String>,

    /// Config file path (defaults to ~/.sessiond/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let daemon_config = match config::load_config(cli.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load daemon config; using defaults");
            config::DaemonConfig::default()
        }
    };

    let store_uri = match resolve_store_uri_or(
        cli.store_uri.as_deref(),
        daemon_config.store_uri.as_deref(),
    ) {
        Ok(uri) => Ok(uri),
        // An unusable URI is a failed connect, not a startup failure.
        Err(StoreError::InvalidUri(raw)) => Err(raw),
        Err(err) => {
            error!(error = %err, "Failed to resolve store URI");
            std::process::exit(1);
        }
    };
    let store_label = match &store_uri {
        Ok(uri) => uri.to_string(),
        Err(raw) => raw.clone(),
    };

    if let Err(err) = shutdown::install_signal_handlers() {
        error!(error = %err, "Failed to install signal handlers");
        std::process::exit(1);
    }

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let store = Arc::new(SqliteStore::with_ttl(daemon_config.session_ttl()));
    let shared_state = Arc::new(SharedState::new(store, store_label.clone()));
    let shutdown_guard = shared_state.monitor.shutdown_guard();

    // Requests are served fail-open while the store is unavailable.
    let connected = match &store_uri {
        Ok(uri) => shared_state.monitor.connect_uri(uri),
        Err(raw) => shared_state.monitor.connect(raw),
    };
    if !connected {
        warn!(uri = %store_label, "Store unavailable at startup; serving unauthenticated");
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            drop(shutdown_guard);
            std::process::exit(1);
        }
    };
    if let Err(err) = listener.set_nonblocking(true) {
        error!(error = %err, "Failed to configure daemon socket");
        drop(shutdown_guard);
        std::process::exit(1);
    }

    info!(
        path = %socket_path.display(),
        store_uri = %store_label,
        state = %shared_state.monitor.current_state(),
        session_ttl_secs = daemon_config.session_ttl_secs,
        probe_interval_secs = daemon_config.probe_interval_secs,
        "sessiond started"
    );

    let probe_handle =
        probe::spawn_health_probe(Arc::clone(&shared_state), daemon_config.probe_interval());

    accept_loop(&listener, &shared_state);

    info!("Shutdown requested");
    drop(listener);
    if let Err(err) = remove_existing_socket(&socket_path) {
        warn!(error = %err, "Failed to remove daemon socket on shutdown");
    }
    if probe_handle.join().is_err() {
        warn!("Health probe thread panicked");
    }
    shutdown_guard.release();
    info!("sessiond stopped");
}

fn accept_loop(listener: &UnixListener, shared_state: &Arc<SharedState>) {
    while !shutdown::requested() {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    warn!(error = %err, "Failed to configure daemon connection");
                    continue;
                }
                match shared_state.try_acquire_connection(MAX_ACTIVE_CONNECTIONS) {
                    Some(permit) => {
                        let state = Arc::clone(shared_state);
                        thread::spawn(move || handle_connection(stream, state, permit));
                    }
                    None => reject_connection(stream),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn reject_connection(mut stream: UnixStream) {
    warn!("Rejecting daemon connection: too many active connections");
    let response = Response::error(
        None,
        ERROR_TOO_MANY_CONNECTIONS,
        "too many active connections",
    );
    let _ = ipc::write_response(&mut stream, response);
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>, _permit: ConnectionPermit) {
    let request = match ipc::read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = ipc::write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handlers::handle_request(request, &state);
    let _ = ipc::write_response(&mut stream, response);
}

fn init_logging() {
    let debug_enabled = env::var("SESSIOND_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    session_core::sessiond_dir()
        .map(|dir| dir.join(SOCKET_NAME))
        .ok_or_else(|| "Home directory not found".to_string())
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}
