//! Request dispatch.
//!
//! `auto_restore` is the pipeline hook and always answers `ok`: a request
//! that cannot be restored gets an unrestored annotation, never an error.

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use sessiond_protocol::{
    parse_auto_restore, parse_end_session, parse_save_session, Method, Request, Response,
    ERROR_STORE_UNAVAILABLE, PROTOCOL_VERSION,
};

use crate::state::SharedState;

pub const MAX_ACTIVE_CONNECTIONS: usize = 64;

pub fn handle_request(request: Request, state: &SharedState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::AutoRestore => handle_auto_restore(request, state),
        Method::SaveSession => handle_save_session(request, state),
        Method::EndSession => handle_end_session(request, state),
        Method::GetHealth => handle_health(request, state),
        Method::GetStoreStats => match state.monitor.stats() {
            Ok(stats) => to_response(request.id, &stats, "store stats"),
            Err(err) => Response::error(request.id, ERROR_STORE_UNAVAILABLE, err.to_string()),
        },
        Method::ListCollections => match state.monitor.list_collections() {
            Ok(collections) => {
                debug!(collections = collections.len(), "Collections snapshot");
                to_response(request.id, &collections, "collections")
            }
            Err(err) => Response::error(request.id, ERROR_STORE_UNAVAILABLE, err.to_string()),
        },
        Method::Ping => {
            let reachable = state.monitor.ping().is_ok();
            Response::ok(
                request.id,
                json!({
                    "pong": true,
                    "store_reachable": reachable,
                    "state": state.monitor.current_state().as_str(),
                }),
            )
        }
    }
}

fn handle_auto_restore(request: Request, state: &SharedState) -> Response {
    let params = match parse_auto_restore(request.params) {
        Ok(params) => params,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    let annotation = state.resolver.auto_restore(params.identity_key.as_deref());
    debug!(
        identity_key = ?params.identity_key,
        restored = annotation.session_restored(),
        "Auto-restore evaluated"
    );
    to_response(request.id, &annotation, "annotation")
}

fn handle_save_session(request: Request, state: &SharedState) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => {
            return Response::error(
                request.id,
                "invalid_params",
                "identity_key and payload are required",
            )
        }
    };
    let params = match parse_save_session(params) {
        Ok(params) => params,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    if !state.monitor.is_healthy() {
        return Response::error(request.id, ERROR_STORE_UNAVAILABLE, "store is not connected");
    }

    match state.store.save_session(&params.identity_key, &params.payload) {
        Ok(record) => {
            info!(identity_key = %record.identity_key, "Session saved");
            Response::ok(
                request.id,
                json!({
                    "saved": true,
                    "identity_key": record.identity_key,
                    "created_at": record.created_at.to_rfc3339(),
                    "last_validated_at": record.last_validated_at.to_rfc3339(),
                }),
            )
        }
        Err(err) => {
            warn!(identity_key = %params.identity_key, error = %err, "Failed to save session");
            Response::error(request.id, "save_error", err.to_string())
        }
    }
}

fn handle_end_session(request: Request, state: &SharedState) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => return Response::error(request.id, "invalid_params", "identity_key is required"),
    };
    let params = match parse_end_session(params) {
        Ok(params) => params,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    if !state.monitor.is_healthy() {
        return Response::error(request.id, ERROR_STORE_UNAVAILABLE, "store is not connected");
    }

    match state.store.delete_session(&params.identity_key) {
        Ok(deleted) => {
            info!(identity_key = %params.identity_key, deleted, "Session ended");
            Response::ok(request.id, json!({ "deleted": deleted }))
        }
        Err(err) => {
            warn!(identity_key = %params.identity_key, error = %err, "Failed to end session");
            Response::error(request.id, "delete_error", err.to_string())
        }
    }
}

fn handle_health(request: Request, state: &SharedState) -> Response {
    let monitor = &state.monitor;
    let mut data = json!({
        "status": "ok",
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "store": {
            "uri": state.store_uri,
            "state": monitor.current_state().as_str(),
            "healthy": monitor.is_healthy(),
            "last_transition_at": monitor.last_transition_at().to_rfc3339(),
            "session_ttl_secs": state.store.ttl().map(|ttl| ttl.num_seconds()),
        },
    });
    if let Ok(value) = serde_json::to_value(state.resolver.stats()) {
        data["resolver"] = value;
    }
    if let Ok(value) = serde_json::to_value(state.security_snapshot(MAX_ACTIVE_CONNECTIONS)) {
        data["security"] = value;
    }
    if let Ok(value) = serde_json::to_value(state.recent_transitions()) {
        data["transitions"] = value;
    }
    Response::ok(request.id, data)
}

fn to_response<T: Serialize>(id: Option<String>, value: &T, label: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", label, err),
        ),
    }
}
