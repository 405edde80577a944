//! Action argument binding: validation against declared args and `{name}` substitution
//! into command parts.

use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

use crate::config::{ActionArg, ActionSpec, ArgKind, ArgOptions};
use crate::jsonpath;

pub type ArgValues = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgError {
    #[error("{name}: value is required.")]
    Required { name: String },
    #[error("{name}: value must be one of available options.")]
    NotAnOption { name: String },
    #[error("{name}: value must be an integer.")]
    NotInteger { name: String },
    #[error("{name}: value must be a number.")]
    NotNumber { name: String },
    #[error("{name}: value must be true/false.")]
    NotBool { name: String },
    #[error("{name}: value does not match required pattern.")]
    PatternMismatch { name: String },
    #[error("{name}: invalid regex pattern in action metadata.")]
    InvalidPattern { name: String },
}

/// Text form of an option entry; strings are taken verbatim.
pub fn option_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Options an argument may take right now. JSONPath options are read from the last good
/// status payload; no payload means no restriction.
pub fn arg_options(arg: &ActionArg, status: Option<&Value>) -> Vec<String> {
    match &arg.options {
        ArgOptions::None => Vec::new(),
        ArgOptions::Literal(options) => options.clone(),
        ArgOptions::JsonPath(path) => status
            .and_then(|payload| jsonpath::resolve(payload, path))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(option_text)
                    .filter(|text| !text.trim().is_empty())
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Validates one raw value and returns its normalized text. An empty optional value
/// normalizes to `""`.
pub fn validate_arg_value(
    raw: &str,
    arg: &ActionArg,
    options: &[String],
) -> Result<String, ArgError> {
    let name = || arg.name.clone();
    let text = raw.trim();
    if text.is_empty() {
        if arg.required {
            return Err(ArgError::Required { name: name() });
        }
        return Ok(String::new());
    }
    if !options.is_empty() && !options.iter().any(|option| option == text) {
        return Err(ArgError::NotAnOption { name: name() });
    }

    match arg.kind {
        ArgKind::Int => text
            .parse::<i64>()
            .map(|value| value.to_string())
            .map_err(|_| ArgError::NotInteger { name: name() }),
        ArgKind::Float => text
            .parse::<f64>()
            .map(|value| format!("{value:?}"))
            .map_err(|_| ArgError::NotNumber { name: name() }),
        ArgKind::Bool => match text.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok("true".to_string()),
            "false" | "0" | "no" | "n" => Ok("false".to_string()),
            _ => Err(ArgError::NotBool { name: name() }),
        },
        ArgKind::String => {
            if let Some(pattern) = &arg.pattern {
                let regex =
                    Regex::new(pattern).map_err(|_| ArgError::InvalidPattern { name: name() })?;
                if !regex.is_match(text) {
                    return Err(ArgError::PatternMismatch { name: name() });
                }
            }
            Ok(text.to_string())
        }
    }
}

/// Validates every declared arg of `action` and returns the substitution map.
///
/// A single declared arg may also be supplied as `value` and is additionally bound to
/// `{value}`. Undeclared supplied args pass through verbatim.
pub fn bind_args(
    action: &ActionSpec,
    supplied: &ArgValues,
    status: Option<&Value>,
) -> Result<ArgValues, ArgError> {
    let single = action.args.len() == 1;
    let mut bound = ArgValues::new();
    for arg in &action.args {
        let raw = supplied
            .get(&arg.name)
            .or_else(|| single.then(|| supplied.get("value")).flatten())
            .map(String::as_str)
            .unwrap_or("");
        let options = arg_options(arg, status);
        let value = validate_arg_value(raw, arg, &options)?;
        if single {
            bound.insert("value".to_string(), value.clone());
        }
        bound.insert(arg.name.clone(), value);
    }
    for (key, value) in supplied {
        bound.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Ok(bound)
}

/// Replaces each `{name}` in `text` with its bound value in one pass. Inserted values are
/// never rescanned; unknown names are left as written.
pub fn apply_placeholder(text: &str, values: &ArgValues) -> String {
    placeholder_regex()
        .replace_all(text, |caps: &Captures<'_>| match values.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub fn apply_placeholders(parts: &[String], values: &ArgValues) -> Vec<String> {
    parts
        .iter()
        .map(|part| apply_placeholder(part, values))
        .collect()
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_.\-]*)\}").expect("valid regex")
    })
}

/// First `{identifier}` in the template `parts` that `values` does not bind, if any.
pub fn find_unresolved<'a, I>(parts: I, values: &ArgValues) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    parts.into_iter().find_map(|part| {
        placeholder_regex()
            .captures_iter(part)
            .find(|caps| !values.contains_key(&caps[1]))
            .map(|caps| caps[0].to_string())
    })
}
