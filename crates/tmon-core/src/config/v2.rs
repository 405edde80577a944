use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use super::schema::{
    assert_allowed_keys, check_object_list, check_optional_object, check_tab, expect_object,
    ACTION_OUTPUT_KEYS, V2_ACTION_KEYS, V2_ARG_KEYS, V2_CONTAINER_KEYS, V2_CONTROL_KEYS,
    V2_LOG_KEYS, V2_TARGET_KEYS, V2_UI_KEYS,
};
use super::{
    decode, ensure_unique, non_blank, normalize_cmd, refresh_interval, seconds, ActionArg,
    ActionOutputLimits, ActionSpec, ArgKind, ArgOptions, ConfigError, ControlConfig, Defaults,
    LogStreamConfig, SchemaVersion, Target, TextEncoding, UiTab, Widgets,
    DEFAULT_ACTION_TIMEOUT_SECONDS, DEFAULT_JOB_POLL_MS, DEFAULT_LOG_POLL_MS,
    DEFAULT_MAX_LINE_BYTES, DEFAULT_TAIL_LINES, MIN_JOB_POLL_MS, MIN_LOG_POLL_MS,
    MIN_MAX_LINE_BYTES,
};
use crate::control::Endpoint;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTarget {
    id: Option<String>,
    title: Option<String>,
    refresh_seconds: Option<f64>,
    control: RawControl,
    logs: Option<Vec<RawLog>>,
    actions: Option<Vec<RawAction>>,
    ui: RawUi,
    action_output: Option<RawActionOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawControl {
    mode: Option<String>,
    endpoint: Option<String>,
    app_id: Option<String>,
    timeout_seconds: Option<f64>,
    job_poll_ms: Option<u64>,
    job_timeout_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    stream: Option<String>,
    title: Option<String>,
    glob: Option<String>,
    tail_lines: Option<usize>,
    max_line_bytes: Option<usize>,
    poll_ms: Option<u64>,
    encoding: Option<String>,
    allow_missing: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAction {
    name: Option<String>,
    label: Option<String>,
    cwd: Option<String>,
    cmd: Option<Vec<String>>,
    timeout_seconds: Option<f64>,
    confirm: Option<String>,
    show_output_panel: Option<bool>,
    mutex: Option<String>,
    detached: Option<bool>,
    args: Option<Vec<RawArg>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArg {
    name: Option<String>,
    label: Option<String>,
    required: Option<bool>,
    #[serde(rename = "type")]
    kind: Option<String>,
    pattern: Option<String>,
    options: Option<Vec<Value>>,
    options_jsonpath: Option<String>,
    placeholder: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUi {
    tabs: Vec<UiTab>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawActionOutput {
    max_lines: Option<usize>,
    max_bytes: Option<usize>,
}

/// Normalizes a strict include: either one target document or a `target`/`targets[]`
/// container.
pub(crate) fn normalize_include(
    payload: &Map<String, Value>,
    source_path: &Path,
    defaults: &Defaults,
) -> Result<Vec<Target>, ConfigError> {
    let is_container = payload.contains_key("target") || payload.contains_key("targets");
    let single = (!is_container).then(|| Value::Object(payload.clone()));
    let mut candidates: Vec<(String, &Value)> = Vec::new();
    if is_container {
        let container_context = format!("v2 include container {}", source_path.display());
        assert_allowed_keys(payload, V2_CONTAINER_KEYS, &container_context)?;
        if let Some(target) = payload.get("target").filter(|value| !value.is_null()) {
            candidates.push((format!("target in {}", source_path.display()), target));
        }
        match payload.get("targets") {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => {
                for (index, item) in items.iter().enumerate() {
                    candidates.push((
                        format!("target[{}] in {}", index + 1, source_path.display()),
                        item,
                    ));
                }
            }
            Some(_) => {
                return Err(ConfigError::invalid(
                    format!("{container_context}.targets"),
                    "must be a list",
                ))
            }
        }
    }

    if let Some(single) = &single {
        candidates.push((format!("target in {}", source_path.display()), single));
    }

    let mut targets = Vec::with_capacity(candidates.len());
    for (context, candidate) in candidates {
        check_target_schema(candidate, &context)?;
        let raw: RawTarget = decode(candidate, &context)?;
        targets.push(normalize_target(raw, source_path, defaults, &context)?);
    }
    Ok(targets)
}

fn check_target_schema(candidate: &Value, context: &str) -> Result<(), ConfigError> {
    let object = expect_object(candidate, context)?;
    assert_allowed_keys(object, V2_TARGET_KEYS, context)?;

    let control = object
        .get("control")
        .filter(|value| !value.is_null())
        .ok_or_else(|| ConfigError::invalid(context, "is missing control object"))?;
    let control_context = format!("{context}.control");
    assert_allowed_keys(
        expect_object(control, &control_context)?,
        V2_CONTROL_KEYS,
        &control_context,
    )?;

    check_object_list(object, "logs", V2_LOG_KEYS, context)?;
    check_object_list(object, "actions", V2_ACTION_KEYS, context)?;
    if let Some(Value::Array(actions)) = object.get("actions") {
        for (index, action) in actions.iter().enumerate() {
            let action_context = format!("{context}.actions[{}]", index + 1);
            check_object_list(
                expect_object(action, &action_context)?,
                "args",
                V2_ARG_KEYS,
                &action_context,
            )?;
        }
    }

    let ui = object
        .get("ui")
        .filter(|value| !value.is_null())
        .ok_or_else(|| ConfigError::invalid(context, "is missing ui object"))?;
    let ui_context = format!("{context}.ui");
    let ui = expect_object(ui, &ui_context)?;
    assert_allowed_keys(ui, V2_UI_KEYS, &ui_context)?;
    let tabs = ui
        .get("tabs")
        .and_then(Value::as_array)
        .ok_or_else(|| ConfigError::invalid(format!("{ui_context}.tabs"), "must be a list"))?;
    for (index, tab) in tabs.iter().enumerate() {
        check_tab(tab, &format!("{ui_context}.tabs[{}]", index + 1))?;
    }

    check_optional_object(object, "actionOutput", ACTION_OUTPUT_KEYS, context)
}

fn normalize_target(
    raw: RawTarget,
    source_path: &Path,
    defaults: &Defaults,
    context: &str,
) -> Result<Target, ConfigError> {
    let id = non_blank(raw.id).ok_or_else(|| ConfigError::invalid(context, "is missing id"))?;
    let context = format!("{context} ('{id}')");
    let title = non_blank(raw.title).unwrap_or_else(|| id.clone());

    let control = normalize_control(raw.control, defaults, &format!("{context}.control"))?;

    let mut log_streams = Vec::new();
    for (index, log) in raw.logs.unwrap_or_default().into_iter().enumerate() {
        log_streams.push(normalize_log(log, &format!("{context}.logs[{}]", index + 1))?);
    }
    let streams = ensure_unique(
        log_streams.iter().map(|log| log.stream.as_str()),
        "log stream",
        &context,
    )?;

    let mut actions = Vec::new();
    for (index, action) in raw.actions.unwrap_or_default().into_iter().enumerate() {
        actions.push(normalize_action(
            action,
            &format!("{context}.actions[{}]", index + 1),
        )?);
    }
    let action_names = ensure_unique(
        actions.iter().map(|action| action.name.as_str()),
        "action",
        &context,
    )?;

    check_references(&raw.ui.tabs, &streams, &action_names, &context)?;

    let action_output = match raw.action_output {
        Some(limits) => ActionOutputLimits::new(
            limits
                .max_lines
                .unwrap_or(defaults.action_output.max_lines),
            limits
                .max_bytes
                .unwrap_or(defaults.action_output.max_bytes),
        ),
        None => defaults.action_output,
    };

    Ok(Target {
        refresh: refresh_interval(
            raw.refresh_seconds.unwrap_or(defaults.refresh_seconds),
            &context,
        )?,
        title,
        schema_version: SchemaVersion::V2,
        control: Some(control),
        status_command: None,
        log_streams,
        actions,
        action_output,
        ui: raw.ui.tabs,
        source_path: source_path.to_path_buf(),
        id,
    })
}

fn normalize_control(
    raw: RawControl,
    defaults: &Defaults,
    context: &str,
) -> Result<ControlConfig, ConfigError> {
    let mode = non_blank(raw.mode).unwrap_or_else(|| "ipc".to_string());
    if !mode.eq_ignore_ascii_case("ipc") {
        return Err(ConfigError::invalid(
            context,
            format!("mode must be 'ipc' (got '{mode}')"),
        ));
    }
    let endpoint = non_blank(raw.endpoint)
        .ok_or_else(|| ConfigError::invalid(context, "is missing endpoint"))?;
    endpoint
        .parse::<Endpoint>()
        .map_err(|err| ConfigError::invalid(context, err.to_string()))?;
    let app_id =
        non_blank(raw.app_id).ok_or_else(|| ConfigError::invalid(context, "is missing appId"))?;

    let timeout = seconds(
        raw.timeout_seconds
            .unwrap_or(defaults.command_timeout_seconds),
        context,
        "timeoutSeconds",
    )?;
    // Jobs default to the action timeout, not the request timeout.
    let job_timeout = seconds(
        raw.job_timeout_seconds
            .unwrap_or(DEFAULT_ACTION_TIMEOUT_SECONDS),
        context,
        "jobTimeoutSeconds",
    )?;
    Ok(ControlConfig {
        endpoint,
        app_id,
        timeout,
        job_poll: Duration::from_millis(
            raw.job_poll_ms
                .unwrap_or(DEFAULT_JOB_POLL_MS)
                .max(MIN_JOB_POLL_MS),
        ),
        job_timeout,
    })
}

fn normalize_log(raw: RawLog, context: &str) -> Result<LogStreamConfig, ConfigError> {
    let stream =
        non_blank(raw.stream).ok_or_else(|| ConfigError::invalid(context, "is missing stream"))?;
    let encoding = match non_blank(raw.encoding) {
        Some(text) => text
            .parse::<TextEncoding>()
            .map_err(|message| ConfigError::invalid(context, message))?,
        None => TextEncoding::Utf8,
    };
    Ok(LogStreamConfig {
        title: non_blank(raw.title).unwrap_or_else(|| stream.clone()),
        glob: raw.glob.unwrap_or_default().trim().to_string(),
        tail_lines: raw.tail_lines.unwrap_or(DEFAULT_TAIL_LINES).max(1),
        max_line_bytes: raw
            .max_line_bytes
            .unwrap_or(DEFAULT_MAX_LINE_BYTES)
            .max(MIN_MAX_LINE_BYTES),
        poll: Duration::from_millis(
            raw.poll_ms
                .unwrap_or(DEFAULT_LOG_POLL_MS)
                .max(MIN_LOG_POLL_MS),
        ),
        encoding,
        allow_missing: raw.allow_missing.unwrap_or(true),
        stream,
    })
}

fn normalize_action(raw: RawAction, context: &str) -> Result<ActionSpec, ConfigError> {
    let name =
        non_blank(raw.name).ok_or_else(|| ConfigError::invalid(context, "is missing name"))?;
    let mut args = Vec::new();
    for (index, arg) in raw.args.unwrap_or_default().into_iter().enumerate() {
        args.push(normalize_arg(arg, &format!("{context}.args[{}]", index + 1))?);
    }
    ensure_unique(args.iter().map(|arg| arg.name.as_str()), "arg", context)?;

    Ok(ActionSpec {
        label: non_blank(raw.label).unwrap_or_else(|| name.clone()),
        cwd: non_blank(raw.cwd).unwrap_or_default(),
        cmd: normalize_cmd(raw.cmd),
        timeout: seconds(
            raw.timeout_seconds.unwrap_or(DEFAULT_ACTION_TIMEOUT_SECONDS),
            context,
            "timeoutSeconds",
        )?,
        confirm_text: non_blank(raw.confirm),
        show_output_panel: raw.show_output_panel.unwrap_or(true),
        mutex_name: non_blank(raw.mutex),
        detached: raw.detached.unwrap_or(false),
        args,
        name,
    })
}

fn normalize_arg(raw: RawArg, context: &str) -> Result<ActionArg, ConfigError> {
    let name =
        non_blank(raw.name).ok_or_else(|| ConfigError::invalid(context, "is missing name"))?;
    let kind = raw
        .kind
        .as_deref()
        .unwrap_or("string")
        .parse::<ArgKind>()
        .map_err(|message| ConfigError::invalid(context, message))?;
    let pattern = non_blank(raw.pattern);
    if let Some(pattern) = &pattern {
        regex::Regex::new(pattern).map_err(|err| {
            ConfigError::invalid(context, format!("has invalid pattern: {err}"))
        })?;
    }

    let literal: Vec<String> = raw
        .options
        .unwrap_or_default()
        .iter()
        .map(crate::args::option_text)
        .filter(|text| !text.trim().is_empty())
        .collect();
    let options = if !literal.is_empty() {
        ArgOptions::Literal(literal)
    } else if let Some(path) = non_blank(raw.options_jsonpath) {
        ArgOptions::JsonPath(path)
    } else {
        ArgOptions::None
    };

    Ok(ActionArg {
        label: non_blank(raw.label).unwrap_or_else(|| name.clone()),
        required: raw.required.unwrap_or(false),
        kind,
        pattern,
        options,
        placeholder: non_blank(raw.placeholder),
        name,
    })
}

fn check_references(
    tabs: &[UiTab],
    streams: &HashSet<&str>,
    actions: &HashSet<&str>,
    context: &str,
) -> Result<(), ConfigError> {
    for widget in Widgets::new(tabs) {
        if let Some(stream) = widget.stream_ref() {
            if !streams.contains(stream.trim()) {
                return Err(ConfigError::UnresolvedReference {
                    context: format!("{context} log widget"),
                    kind: "log stream",
                    name: stream.to_string(),
                });
            }
        }
        for action in widget.action_refs() {
            if !actions.contains(action.trim()) {
                return Err(ConfigError::UnresolvedReference {
                    context: format!("{context} widget"),
                    kind: "action",
                    name: action.to_string(),
                });
            }
        }
    }
    Ok(())
}
