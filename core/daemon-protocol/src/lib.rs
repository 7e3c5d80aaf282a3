//! IPC protocol types and validation for sessiond.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_IDENTITY_KEY_LEN: usize = 256;
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;

pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";
pub const ERROR_STORE_UNAVAILABLE: &str = "store_unavailable";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    AutoRestore,
    SaveSession,
    EndSession,
    GetHealth,
    GetStoreStats,
    ListCollections,
    Ping,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Params for `auto_restore`. A missing or blank identity is valid and
/// simply resolves to "not restored".
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AutoRestoreParams {
    #[serde(default)]
    pub identity_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SaveSessionParams {
    pub identity_key: String,
    pub payload: String,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EndSessionParams {
    pub identity_key: String,
}

pub fn parse_auto_restore(params: Option<Value>) -> Result<AutoRestoreParams, ErrorInfo> {
    let parsed: AutoRestoreParams = match params {
        None | Some(Value::Null) => return Ok(AutoRestoreParams::default()),
        Some(params) => parse_params(params)?,
    };
    if let Some(key) = parsed.identity_key.as_deref() {
        check_identity_len(key)?;
    }
    Ok(parsed)
}

pub fn parse_save_session(params: Value) -> Result<SaveSessionParams, ErrorInfo> {
    let parsed: SaveSessionParams = parse_params(params)?;
    require_identity(&parsed.identity_key)?;
    if parsed.payload.is_empty() {
        return Err(ErrorInfo::new("missing_field", "payload is required"));
    }
    if parsed.payload.len() > MAX_PAYLOAD_BYTES {
        return Err(ErrorInfo::new(
            "payload_too_large",
            format!("payload must be {} bytes or fewer", MAX_PAYLOAD_BYTES),
        ));
    }
    Ok(parsed)
}

pub fn parse_end_session(params: Value) -> Result<EndSessionParams, ErrorInfo> {
    let parsed: EndSessionParams = parse_params(params)?;
    require_identity(&parsed.identity_key)?;
    Ok(parsed)
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ErrorInfo> {
    if !params.is_object() {
        return Err(ErrorInfo::new("invalid_params", "params must be an object"));
    }
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("invalid params: {}", err)))
}

fn require_identity(value: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "identity_key is required"));
    }
    check_identity_len(value)
}

fn check_identity_len(value: &str) -> Result<(), ErrorInfo> {
    if value.len() > MAX_IDENTITY_KEY_LEN {
        return Err(ErrorInfo::new(
            "invalid_identity_key",
            format!(
                "identity_key must be {} characters or fewer",
                MAX_IDENTITY_KEY_LEN
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auto_restore_accepts_missing_params() {
        assert_eq!(parse_auto_restore(None).unwrap(), AutoRestoreParams::default());
        assert_eq!(
            parse_auto_restore(Some(Value::Null)).unwrap(),
            AutoRestoreParams::default()
        );
        assert_eq!(
            parse_auto_restore(Some(json!({}))).unwrap(),
            AutoRestoreParams::default()
        );
    }

    #[test]
    fn auto_restore_keeps_blank_identity() {
        let parsed = parse_auto_restore(Some(json!({ "identity_key": "" }))).unwrap();
        assert_eq!(parsed.identity_key.as_deref(), Some(""));
    }

    #[test]
    fn auto_restore_rejects_unknown_fields_and_long_keys() {
        let err = parse_auto_restore(Some(json!({ "user": "alice" }))).unwrap_err();
        assert_eq!(err.code, "invalid_params");

        let err = parse_auto_restore(Some(json!({ "identity_key": "a".repeat(300) })))
            .unwrap_err();
        assert_eq!(err.code, "invalid_identity_key");
    }

    #[test]
    fn save_session_requires_identity_and_payload() {
        let err = parse_save_session(json!({ "identity_key": " ", "payload": "tok" }))
            .unwrap_err();
        assert_eq!(err.code, "missing_field");

        let err = parse_save_session(json!({ "identity_key": "alice", "payload": "" }))
            .unwrap_err();
        assert_eq!(err.code, "missing_field");

        let parsed =
            parse_save_session(json!({ "identity_key": "alice", "payload": "tok123" })).unwrap();
        assert_eq!(parsed.identity_key, "alice");
    }

    #[test]
    fn save_session_rejects_oversized_payload() {
        let payload = "x".repeat(MAX_PAYLOAD_BYTES + 1);
        let err = parse_save_session(json!({ "identity_key": "alice", "payload": payload }))
            .unwrap_err();
        assert_eq!(err.code, "payload_too_large");
    }

    #[test]
    fn params_must_be_objects() {
        let err = parse_end_session(json!(["alice"])).unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn method_names_are_snake_case() {
        let request = Request::new(Method::AutoRestore, Some("req-1".to_string()), None);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["method"], json!("auto_restore"));
        assert_eq!(value["protocol_version"], json!(PROTOCOL_VERSION));
    }
}
