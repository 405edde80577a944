use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 256 * 1024;
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    StatusGet,
    ActionList,
    ActionInvoke,
    ActionJobGet,
    ConfigGet,
    ConfigSet,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::StatusGet => "status.get",
            Method::ActionList => "action.list",
            Method::ActionInvoke => "action.invoke",
            Method::ActionJobGet => "action.job.get",
            Method::ConfigGet => "config.get",
            Method::ConfigSet => "config.set",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "status.get" => Ok(Method::StatusGet),
            "action.list" => Ok(Method::ActionList),
            "action.invoke" => Ok(Method::ActionInvoke),
            "action.job.get" => Ok(Method::ActionJobGet),
            "config.get" => Ok(Method::ConfigGet),
            "config.set" => Ok(Method::ConfigSet),
            other => Err(format!("unsupported method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(method: Method, params: Value) -> Self {
        Self {
            method: method.as_str().to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn success(response: Value) -> Self {
        Self {
            ok: true,
            response: Some(response),
            error: None,
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            response: None,
            error: Some(WireError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Collapses the envelope into the payload or the remote error.
    pub fn into_result(self) -> Result<Value, ProtocolError> {
        if self.ok {
            return Ok(self.response.unwrap_or_else(|| Value::Object(Map::new())));
        }
        let error = self.error.unwrap_or_default();
        let code = if error.code.trim().is_empty() {
            "request_failed".to_string()
        } else {
            error.code
        };
        let message = if error.message.trim().is_empty() {
            "ipc request failed".to_string()
        } else {
            error.message
        };
        Err(ProtocolError::Remote { code, message })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("{method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("ipc io error: {0}")]
    Io(String),
    #[error("ipc response is empty")]
    EmptyResponse,
    #[error("malformed ipc response: {0}")]
    Malformed(String),
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("{message}")]
    Remote { code: String, message: String },
}

impl ProtocolError {
    pub fn code(&self) -> &str {
        match self {
            ProtocolError::InvalidEndpoint { .. } => "invalid_endpoint",
            ProtocolError::Connect { .. } => "connect_failed",
            ProtocolError::Timeout { .. } => "timeout",
            ProtocolError::Io(_) => "io_error",
            ProtocolError::EmptyResponse => "empty_response",
            ProtocolError::Malformed(_) => "malformed_response",
            ProtocolError::OversizedFrame { .. } => "frame_too_large",
            ProtocolError::Encode(_) => "encode_failed",
            ProtocolError::Remote { code, .. } => code,
        }
    }
}

/// Uniform `(code, message)` pair handed to callers of the control client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ControlFailure {
    pub code: String,
    pub message: String,
}

impl From<ProtocolError> for ControlFailure {
    fn from(err: ProtocolError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

impl FromStr for Endpoint {
    type Err = ProtocolError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let text = input.trim();
        let invalid = |reason: &str| ProtocolError::InvalidEndpoint {
            endpoint: text.to_string(),
            reason: reason.to_string(),
        };
        if text.is_empty() {
            return Err(invalid("endpoint is empty"));
        }

        if text.contains("://") {
            let parsed = url::Url::parse(text).map_err(|err| invalid(&err.to_string()))?;
            let host = parsed
                .host_str()
                .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
                .unwrap_or_default()
                .to_string();
            if host.is_empty() {
                return Err(invalid("endpoint host is empty"));
            }
            // `Url::port` hides a port equal to the scheme default, so read the authority.
            let authority = text
                .split_once("://")
                .and_then(|(_, rest)| rest.split(['/', '?', '#']).next())
                .unwrap_or_default();
            let explicit_port = authority.rsplit_once(':').is_some_and(|(_, digits)| {
                !digits.is_empty() && digits.bytes().all(|byte| byte.is_ascii_digit())
            });
            let port = parsed
                .port()
                .or_else(|| explicit_port.then(|| parsed.port_or_known_default()).flatten())
                .ok_or_else(|| invalid("endpoint must include port"))?;
            if port == 0 {
                return Err(invalid("endpoint port is out of range"));
            }
            return Ok(Endpoint { host, port });
        }

        let (host, raw_port) = text
            .rsplit_once(':')
            .ok_or_else(|| invalid("endpoint must be host:port"))?;
        let port: u32 = raw_port
            .trim()
            .parse()
            .map_err(|_| invalid("endpoint port is not a number"))?;
        if port == 0 || port > u32::from(u16::MAX) {
            return Err(invalid("endpoint port is out of range"));
        }
        let host = host.trim().trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        Ok(Endpoint {
            host: host.to_string(),
            port: port as u16,
        })
    }
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| ProtocolError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(ProtocolError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8], max_frame_bytes: usize) -> Result<T, ProtocolError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ProtocolError::EmptyResponse);
    }
    if raw.len() > max_frame_bytes {
        return Err(ProtocolError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| ProtocolError::Malformed(err.to_string()))
}

/// Parses a reply line into the response payload, folding every failure mode into
/// [`ProtocolError`].
pub fn decode_response(bytes: &[u8], max_frame_bytes: usize) -> Result<Value, ProtocolError> {
    let raw: Value = decode_frame(bytes, max_frame_bytes)?;
    if !raw.is_object() {
        return Err(ProtocolError::Malformed(
            "ipc response is not an object".to_string(),
        ));
    }
    let response: Response =
        serde_json::from_value(raw).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    response.into_result()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
    Timeout,
    Cancelled,
    Error,
    #[serde(other)]
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Timeout => "timeout",
            JobState::Cancelled => "cancelled",
            JobState::Error => "error",
            JobState::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded
                | JobState::Failed
                | JobState::Timeout
                | JobState::Cancelled
                | JobState::Error
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobHandle {
    #[serde(rename = "jobId")]
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub state: JobState,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default, rename = "exitCode")]
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteAction {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub cmd: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionCatalog {
    #[serde(default)]
    pub actions: Vec<RemoteAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigPathEntry {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigEntry {
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub settable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Value>,
    #[serde(default, rename = "pathEntry")]
    pub path_entry: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigView {
    pub paths: Vec<ConfigPathEntry>,
    pub entries: Vec<ConfigEntry>,
}

impl ConfigView {
    /// Normalizes a `config.get` payload. `paths` may be a list of `{key, value|path}` or
    /// a plain map; entries accept the legacy `allowedValues` key and inherit the path of
    /// a same-named `paths` item.
    pub fn from_payload(payload: &Value) -> Self {
        let paths = normalize_paths(payload.get("paths"));
        let entries = normalize_entries(payload.get("entries"), &paths);
        Self { paths, entries }
    }
}

fn normalize_paths(raw: Option<&Value>) -> Vec<ConfigPathEntry> {
    match raw {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|item| {
                let key = item.get("key").and_then(value_as_text)?.trim().to_string();
                if key.is_empty() {
                    return None;
                }
                let value = match item.get("value") {
                    Some(Value::Null) | None => item.get("path").cloned().unwrap_or(Value::Null),
                    Some(value) => value.clone(),
                };
                Some(ConfigPathEntry { key, value })
            })
            .collect(),
        Some(Value::Object(map)) => map
            .iter()
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, value)| ConfigPathEntry {
                key: key.trim().to_string(),
                value: value.clone(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn normalize_entries(raw: Option<&Value>, paths: &[ConfigPathEntry]) -> Vec<ConfigEntry> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|item| {
            let key = item.get("key").and_then(value_as_text)?.trim().to_string();
            if key.is_empty() {
                return None;
            }
            let allowed = item
                .get("allowed")
                .or_else(|| item.get("allowedValues"))
                .and_then(Value::as_array)
                .cloned();
            let mut path = item
                .get("path")
                .filter(|value| value_as_text(value).map_or(true, |text| !text.trim().is_empty()))
                .filter(|value| !value.is_null())
                .cloned();
            let mut path_entry = item
                .get("pathEntry")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if let Some(linked) = paths.iter().find(|candidate| candidate.key == key) {
                if path.is_none() {
                    path = Some(linked.value.clone());
                }
                if item.get("pathEntry").is_none() {
                    path_entry = true;
                }
            }
            Some(ConfigEntry {
                key,
                value: item.get("value").cloned().unwrap_or(Value::Null),
                settable: item.get("settable").and_then(Value::as_bool).unwrap_or(false),
                allowed,
                path,
                path_entry,
            })
        })
        .collect()
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_is_single_json_line() {
        let request = Request::new(Method::StatusGet, json!({"appId": "bridge"}));
        let frame = encode_frame(&request, DEFAULT_MAX_REQUEST_BYTES).expect("encode");
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|byte| **byte == b'\n').count(), 1);
        let text = String::from_utf8(frame).expect("utf8");
        assert_eq!(
            text,
            "{\"method\":\"status.get\",\"params\":{\"appId\":\"bridge\"}}\n"
        );
    }

    #[test]
    fn ok_response_yields_payload() {
        let payload = decode_response(
            b"{\"ok\": true, \"response\": {\"jobId\": \"job-1\"}}\r\n",
            DEFAULT_MAX_RESPONSE_BYTES,
        )
        .expect("decode");
        let handle: JobHandle = serde_json::from_value(payload).expect("job handle");
        assert_eq!(handle.job_id, "job-1");
    }

    #[test]
    fn error_response_keeps_remote_code() {
        let err = decode_response(
            br#"{"ok": false, "error": {"code": "invalid_action", "message": "unknown action: nope"}}"#,
            DEFAULT_MAX_RESPONSE_BYTES,
        )
        .expect_err("remote error");
        let failure = ControlFailure::from(err);
        assert_eq!(failure.code, "invalid_action");
        assert_eq!(failure.message, "unknown action: nope");
    }

    #[test]
    fn bare_failure_without_error_object_defaults() {
        let err = decode_response(br#"{"ok": false}"#, DEFAULT_MAX_RESPONSE_BYTES)
            .expect_err("failure");
        assert_eq!(err.code(), "request_failed");
    }

    #[test]
    fn empty_and_malformed_lines_are_protocol_errors() {
        assert_eq!(
            decode_response(b"\n", DEFAULT_MAX_RESPONSE_BYTES),
            Err(ProtocolError::EmptyResponse)
        );
        let malformed = decode_response(b"{\"ok\":", DEFAULT_MAX_RESPONSE_BYTES)
            .expect_err("malformed");
        assert_eq!(malformed.code(), "malformed_response");
        let not_object = decode_response(b"[1,2]", DEFAULT_MAX_RESPONSE_BYTES)
            .expect_err("array");
        assert_eq!(not_object.code(), "malformed_response");
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let request = Request::new(Method::ConfigSet, json!({"value": "x".repeat(128)}));
        assert!(matches!(
            encode_frame(&request, 64),
            Err(ProtocolError::OversizedFrame { .. })
        ));
        let line = format!("{{\"ok\":true,\"response\":{{\"blob\":\"{}\"}}}}", "x".repeat(256));
        assert!(matches!(
            decode_response(line.as_bytes(), 64),
            Err(ProtocolError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn endpoint_accepts_host_port_and_url_forms() {
        let plain: Endpoint = "127.0.0.1:8765".parse().expect("plain");
        assert_eq!(plain, Endpoint { host: "127.0.0.1".into(), port: 8765 });

        let bare: Endpoint = ":9000".parse().expect("default host");
        assert_eq!(bare.host, "127.0.0.1");

        let url: Endpoint = "tcp://monitor.lan:7000".parse().expect("url");
        assert_eq!(url, Endpoint { host: "monitor.lan".into(), port: 7000 });

        let default_port: Endpoint = "http://monitor.lan:80/".parse().expect("explicit default");
        assert_eq!(default_port.port, 80);

        for bad in [
            "",
            "localhost",
            "host:0",
            "host:65536",
            "host:abc",
            "tcp://host",
            "tcp://:80",
            "http://monitor.lan",
            "https://[::1]/",
        ] {
            assert!(bad.parse::<Endpoint>().is_err(), "endpoint {bad:?}");
        }
    }

    #[test]
    fn job_states_classify_terminal() {
        for (raw, terminal) in [
            ("running", false),
            ("succeeded", true),
            ("failed", true),
            ("timeout", true),
            ("cancelled", true),
            ("error", true),
            ("queued", false),
        ] {
            let snapshot: JobSnapshot =
                serde_json::from_value(json!({"state": raw})).expect("snapshot");
            assert_eq!(snapshot.state.is_terminal(), terminal, "state {raw}");
        }
    }

    #[test]
    fn config_view_normalizes_paths_and_entries() {
        let view = ConfigView::from_payload(&json!({
            "paths": {"profilePath": "C:/demo/profiles/sim.json"},
            "entries": [
                {"key": "profilePath", "value": "sim", "settable": true, "allowedValues": ["sim", "lab"]},
                {"key": "mode", "value": "live", "settable": true, "allowed": ["sim", "live"]},
                {"key": "", "value": "skipped"},
                "not-an-object"
            ]
        }));
        assert_eq!(view.paths.len(), 1);
        assert_eq!(view.entries.len(), 2);

        let profile = &view.entries[0];
        assert_eq!(profile.allowed, Some(vec![json!("sim"), json!("lab")]));
        assert_eq!(profile.path, Some(json!("C:/demo/profiles/sim.json")));
        assert!(profile.path_entry);

        let mode = &view.entries[1];
        assert_eq!(mode.path, None);
        assert!(!mode.path_entry);
    }

    #[test]
    fn config_view_path_list_falls_back_to_path_field() {
        let view = ConfigView::from_payload(&json!({
            "paths": [{"key": "root", "path": "/srv/app"}, {"value": "orphan"}]
        }));
        assert_eq!(view.paths, vec![ConfigPathEntry { key: "root".into(), value: json!("/srv/app") }]);
        assert!(view.entries.is_empty());
    }
}
