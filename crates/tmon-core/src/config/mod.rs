//! Monitor configuration: a root manifest that includes per-target documents in either the
//! legacy v1 layout or the strict v2 layout, normalized into one immutable [`MonitorConfig`].

mod load;
mod model;
pub mod schema;
mod v1;
mod v2;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub use load::{load_config, load_json_object};
pub use model::*;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("expected object JSON: {}", .path.display())]
    NotObject { path: PathBuf },
    #[error("{context} has unsupported keys: {}", .keys.join(", "))]
    UnsupportedKeys { context: String, keys: Vec<String> },
    #[error("{context} {message}")]
    Invalid { context: String, message: String },
    #[error("{context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{context} references unknown {kind} '{name}'")]
    UnresolvedReference {
        context: String,
        kind: &'static str,
        name: String,
    },
    #[error("{context} declares {kind} '{name}' more than once")]
    Duplicate {
        context: String,
        kind: &'static str,
        name: String,
    },
    #[error("duplicate target id '{id}' in {} (first defined in {})", .second.display(), .first.display())]
    DuplicateTarget {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("unsupported configVersion={version} in {}", .path.display())]
    UnsupportedVersion { version: String, path: PathBuf },
}

impl ConfigError {
    pub fn invalid(context: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            context: context.into(),
            message: message.into(),
        }
    }
}

/// Root-level values that every include inherits unless it overrides them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Defaults {
    pub refresh_seconds: f64,
    pub command_timeout_seconds: f64,
    pub action_output: ActionOutputLimits,
}

/// Lowercases alphanumerics, collapses everything else into single dashes.
pub fn slugify(text: &str, fallback: &str) -> String {
    let cleaned: String = text
        .trim()
        .chars()
        .flat_map(|ch| {
            if ch.is_alphanumeric() {
                ch.to_lowercase().collect::<Vec<_>>()
            } else {
                vec!['-']
            }
        })
        .collect();
    let compact = cleaned
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if compact.is_empty() {
        fallback.to_string()
    } else {
        compact
    }
}

pub(crate) fn seconds(value: f64, context: &str, field: &str) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 || value > 1.0e9 {
        return Err(ConfigError::invalid(
            context,
            format!("{field} must be a positive number of seconds (got {value})"),
        ));
    }
    Ok(Duration::from_secs_f64(value))
}

pub(crate) fn refresh_interval(value: f64, context: &str) -> Result<Duration, ConfigError> {
    seconds(value.max(MIN_REFRESH_SECONDS), context, "refreshSeconds")
}

/// Trims each part and drops blanks; an absent list normalizes to empty.
pub(crate) fn normalize_cmd(parts: Option<Vec<String>>) -> Vec<String> {
    parts
        .unwrap_or_default()
        .into_iter()
        .filter(|part| !part.trim().is_empty())
        .collect()
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

pub(crate) fn ensure_unique<'a>(
    names: impl IntoIterator<Item = &'a str>,
    kind: &'static str,
    context: &str,
) -> Result<HashSet<&'a str>, ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::Duplicate {
                context: context.to_string(),
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(seen)
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(
    value: &serde_json::Value,
    context: &str,
) -> Result<T, ConfigError> {
    serde_json::from_value(value.clone()).map_err(|source| ConfigError::Decode {
        context: context.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("  Restart Server!! ", "x"), "restart-server");
        assert_eq!(slugify("App Log (main)", "x"), "app-log-main");
        assert_eq!(slugify("***", "log-3"), "log-3");
    }

    #[test]
    fn seconds_rejects_non_positive_values() {
        assert!(seconds(0.0, "t", "timeoutSeconds").is_err());
        assert!(seconds(f64::NAN, "t", "timeoutSeconds").is_err());
        assert_eq!(
            seconds(1.5, "t", "timeoutSeconds").expect("valid"),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn refresh_interval_is_floor_clamped() {
        assert_eq!(
            refresh_interval(0.01, "t").expect("valid"),
            Duration::from_secs_f64(MIN_REFRESH_SECONDS)
        );
    }
}
