use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::schema::{assert_allowed_keys, check_optional_object, ACTION_OUTPUT_KEYS, ROOT_KEYS};
use super::{
    decode, refresh_interval, seconds, v1, v2, ActionOutputLimits, ConfigError, Defaults,
    MonitorConfig, DEFAULT_ACTION_OUTPUT_MAX_BYTES, DEFAULT_ACTION_OUTPUT_MAX_LINES,
    DEFAULT_COMMAND_TIMEOUT_SECONDS, DEFAULT_REFRESH_SECONDS,
};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRoot {
    refresh_seconds: Option<f64>,
    command_timeout_seconds: Option<f64>,
    action_output: Option<RawLimits>,
    include_files: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLimits {
    max_lines: Option<usize>,
    max_bytes: Option<usize>,
}

/// Reads a JSON document that must be an object. A leading UTF-8 BOM is accepted.
pub fn load_json_object(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
    let value: Value = serde_json::from_slice(body).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::NotObject {
            path: path.to_path_buf(),
        }),
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<MonitorConfig, ConfigError> {
    let path = path.as_ref();
    let root = load_json_object(path)?;
    let context = format!("Root config {}", path.display());
    assert_allowed_keys(&root, ROOT_KEYS, &context)?;
    check_optional_object(&root, "actionOutput", ACTION_OUTPUT_KEYS, &context)?;
    let raw: RawRoot = decode(&Value::Object(root), &context)?;

    let include_files = require_include_list(raw.include_files, &context)?;
    let limits = raw.action_output.unwrap_or(RawLimits {
        max_lines: None,
        max_bytes: None,
    });
    let defaults = Defaults {
        refresh_seconds: raw.refresh_seconds.unwrap_or(DEFAULT_REFRESH_SECONDS),
        command_timeout_seconds: raw
            .command_timeout_seconds
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECONDS),
        action_output: ActionOutputLimits::new(
            limits.max_lines.unwrap_or(DEFAULT_ACTION_OUTPUT_MAX_LINES),
            limits.max_bytes.unwrap_or(DEFAULT_ACTION_OUTPUT_MAX_BYTES),
        ),
    };
    let refresh = refresh_interval(defaults.refresh_seconds, &context)?;
    let command_timeout = seconds(
        defaults.command_timeout_seconds,
        &context,
        "commandTimeoutSeconds",
    )?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    let mut resolved_includes = Vec::with_capacity(include_files.len());
    let mut targets = Vec::new();
    let mut first_seen: HashMap<String, PathBuf> = HashMap::new();

    for include in include_files {
        let include_path = resolve_include(base_dir, &include);
        let payload = load_json_object(&include_path)?;
        let included = match include_version(&payload, &include_path)? {
            1 => v1::normalize_include(&payload, &include_path, &defaults)?,
            _ => v2::normalize_include(&payload, &include_path, &defaults)?,
        };
        for target in included {
            if let Some(first) = first_seen.get(&target.id) {
                return Err(ConfigError::DuplicateTarget {
                    id: target.id,
                    first: first.clone(),
                    second: include_path,
                });
            }
            first_seen.insert(target.id.clone(), include_path.clone());
            targets.push(target);
        }
        resolved_includes.push(include_path);
    }

    Ok(MonitorConfig {
        source_path: path.to_path_buf(),
        refresh,
        command_timeout,
        action_output: defaults.action_output,
        include_files: resolved_includes,
        targets,
    })
}

fn require_include_list(
    value: Option<Vec<String>>,
    context: &str,
) -> Result<Vec<String>, ConfigError> {
    let items = value.ok_or_else(|| ConfigError::invalid(context, "includeFiles must be a list"))?;
    let mut result = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let text = item.trim();
        if text.is_empty() {
            return Err(ConfigError::invalid(
                context,
                format!("includeFiles[{}] must be a non-empty string", index + 1),
            ));
        }
        result.push(text.to_string());
    }
    if result.is_empty() {
        return Err(ConfigError::invalid(
            context,
            "includeFiles must contain at least one item",
        ));
    }
    Ok(result)
}

fn resolve_include(base_dir: &Path, include: &str) -> PathBuf {
    let candidate = Path::new(include);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    }
}

/// `configVersion` defaults to 1; integral numbers and numeric strings are accepted.
fn include_version(payload: &Map<String, Value>, path: &Path) -> Result<u8, ConfigError> {
    let version = match payload.get("configVersion") {
        None | Some(Value::Null) => return Ok(1),
        Some(Value::Number(number)) => number.as_u64(),
        Some(Value::String(text)) => text.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match version {
        Some(1) => Ok(1),
        Some(2) => Ok(2),
        _ => Err(ConfigError::UnsupportedVersion {
            version: payload
                .get("configVersion")
                .map(Value::to_string)
                .unwrap_or_default(),
            path: path.to_path_buf(),
        }),
    }
}
