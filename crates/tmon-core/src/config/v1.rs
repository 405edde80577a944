use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

use super::schema::{
    assert_allowed_keys, check_object_list, expect_object, V1_COMMAND_KEYS, V1_FIELD_KEYS,
    V1_INCLUDE_KEYS, V1_LOG_PANEL_KEYS, V1_TARGET_KEYS,
};
use super::{
    decode, ensure_unique, non_blank, normalize_cmd, refresh_interval, seconds, slugify,
    ActionSpec, Binding, ConfigError, Defaults, LogStreamConfig, SchemaVersion, StatusCommand,
    Target, TextEncoding, UiTab, Widget, DEFAULT_ACTION_TIMEOUT_SECONDS, DEFAULT_LOG_POLL_MS,
    DEFAULT_MAX_LINE_BYTES, DEFAULT_V1_TAIL_LINES,
};
use crate::jsonpath::dot_key_to_jsonpath;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTarget {
    id: Option<String>,
    name: Option<String>,
    title: Option<String>,
    cwd: Option<String>,
    status_command: Option<Vec<String>>,
    status_timeout_seconds: Option<f64>,
    refresh_seconds: Option<f64>,
    commands: Option<Vec<RawCommand>>,
    fields: Option<Vec<RawField>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCommand {
    name: Option<String>,
    label: Option<String>,
    command: Option<Vec<String>>,
    cwd: Option<String>,
    timeout_seconds: Option<f64>,
    confirm: Option<String>,
    show_output_panel: Option<bool>,
    mutex: Option<String>,
    detached: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawField {
    key: Option<String>,
    label: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLogPanel {
    name: Option<String>,
    path: Option<String>,
    tail_lines: Option<usize>,
}

/// Normalizes a legacy include: `target`/`targets[]` share the include's `logPanels[]`.
pub(crate) fn normalize_include(
    payload: &Map<String, Value>,
    source_path: &Path,
    defaults: &Defaults,
) -> Result<Vec<Target>, ConfigError> {
    let include_context = format!("v1 include {}", source_path.display());
    assert_allowed_keys(payload, V1_INCLUDE_KEYS, &include_context)?;
    check_object_list(payload, "logPanels", V1_LOG_PANEL_KEYS, &include_context)?;

    let mut candidates: Vec<&Value> = Vec::new();
    if let Some(target) = payload.get("target").filter(|value| !value.is_null()) {
        candidates.push(target);
    }
    match payload.get("targets") {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => candidates.extend(items.iter()),
        Some(_) => {
            return Err(ConfigError::invalid(
                format!("{include_context}.targets"),
                "must be a list",
            ))
        }
    }
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let panels: Vec<RawLogPanel> = match payload.get("logPanels") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => decode(value, &format!("{include_context}.logPanels"))?,
    };
    let log_streams = normalize_log_panels(panels);
    ensure_unique(
        log_streams.iter().map(|log| log.stream.as_str()),
        "log stream",
        &include_context,
    )?;

    let stem = source_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());

    let mut targets = Vec::with_capacity(candidates.len());
    for (index, candidate) in candidates.into_iter().enumerate() {
        let position = index + 1;
        let context = format!("target[{position}] in {}", source_path.display());
        let object = expect_object(candidate, &context)?;
        assert_allowed_keys(object, V1_TARGET_KEYS, &context)?;
        check_object_list(object, "commands", V1_COMMAND_KEYS, &context)?;
        check_object_list(object, "fields", V1_FIELD_KEYS, &context)?;
        let raw: RawTarget = decode(candidate, &context)?;
        targets.push(normalize_target(
            raw,
            &format!("{stem}-{position}"),
            &log_streams,
            source_path,
            defaults,
            &context,
        )?);
    }
    Ok(targets)
}

fn normalize_log_panels(panels: Vec<RawLogPanel>) -> Vec<LogStreamConfig> {
    panels
        .into_iter()
        .enumerate()
        .map(|(index, panel)| {
            let fallback = format!("log-{}", index + 1);
            let name = non_blank(panel.name);
            let stream = slugify(name.as_deref().unwrap_or(&fallback), &fallback);
            LogStreamConfig {
                title: name.unwrap_or_else(|| stream.clone()),
                stream,
                glob: panel.path.unwrap_or_default().trim().to_string(),
                tail_lines: panel.tail_lines.unwrap_or(DEFAULT_V1_TAIL_LINES).max(1),
                max_line_bytes: DEFAULT_MAX_LINE_BYTES,
                poll: Duration::from_millis(DEFAULT_LOG_POLL_MS),
                encoding: TextEncoding::Utf8,
                allow_missing: true,
            }
        })
        .collect()
}

fn normalize_target(
    raw: RawTarget,
    fallback_id: &str,
    log_streams: &[LogStreamConfig],
    source_path: &Path,
    defaults: &Defaults,
    context: &str,
) -> Result<Target, ConfigError> {
    let id = non_blank(raw.id).unwrap_or_else(|| fallback_id.to_string());
    let context = format!("{context} ('{id}')");
    let title = non_blank(raw.name)
        .or_else(|| non_blank(raw.title))
        .unwrap_or_else(|| id.clone());
    let cwd = non_blank(raw.cwd).unwrap_or_default();

    let status_cmd = normalize_cmd(raw.status_command);
    if status_cmd.is_empty() {
        return Err(ConfigError::invalid(&context, "is missing statusCommand"));
    }
    let status_command = StatusCommand {
        cwd: cwd.clone(),
        cmd: status_cmd,
        timeout: seconds(
            raw.status_timeout_seconds
                .unwrap_or(defaults.command_timeout_seconds),
            &context,
            "statusTimeoutSeconds",
        )?,
    };

    let mut actions = Vec::new();
    for (index, command) in raw.commands.unwrap_or_default().into_iter().enumerate() {
        let position = index + 1;
        let cmd = normalize_cmd(command.command);
        if cmd.is_empty() {
            continue;
        }
        let label = non_blank(command.label).unwrap_or_else(|| format!("Action {position}"));
        let fallback = format!("action-{position}");
        let name = slugify(
            non_blank(command.name).as_deref().unwrap_or(&label),
            &fallback,
        );
        actions.push(ActionSpec {
            timeout: seconds(
                command
                    .timeout_seconds
                    .unwrap_or(DEFAULT_ACTION_TIMEOUT_SECONDS),
                &format!("{context}.commands[{position}]"),
                "timeoutSeconds",
            )?,
            name,
            label,
            cwd: non_blank(command.cwd).unwrap_or_else(|| cwd.clone()),
            cmd,
            confirm_text: non_blank(command.confirm),
            show_output_panel: command.show_output_panel.unwrap_or(true),
            mutex_name: non_blank(command.mutex),
            detached: command.detached.unwrap_or(false),
            args: Vec::new(),
        });
    }
    ensure_unique(
        actions.iter().map(|action| action.name.as_str()),
        "action",
        &context,
    )?;

    let status_items: Vec<Binding> = raw
        .fields
        .unwrap_or_default()
        .into_iter()
        .filter_map(|field| {
            let key = non_blank(field.key)?;
            Some(Binding {
                label: non_blank(field.label).unwrap_or_else(|| key.clone()),
                jsonpath: dot_key_to_jsonpath(&key),
            })
        })
        .collect();

    let ui = synthesize_tabs(status_items, log_streams, &actions);

    Ok(Target {
        refresh: refresh_interval(
            raw.refresh_seconds.unwrap_or(defaults.refresh_seconds),
            &context,
        )?,
        id,
        title,
        schema_version: SchemaVersion::V1,
        control: None,
        status_command: Some(status_command),
        log_streams: log_streams.to_vec(),
        actions,
        action_output: defaults.action_output,
        ui,
        source_path: source_path.to_path_buf(),
    })
}

/// Status, logs and actions tabs in that order, each only when it has content.
fn synthesize_tabs(
    status_items: Vec<Binding>,
    log_streams: &[LogStreamConfig],
    actions: &[ActionSpec],
) -> Vec<UiTab> {
    let mut tabs = Vec::new();
    if !status_items.is_empty() {
        tabs.push(UiTab {
            id: "status".into(),
            title: "Status".into(),
            widgets: vec![Widget::Kv {
                title: Some("Status".into()),
                items: status_items,
            }],
            children: Vec::new(),
        });
    }
    if !log_streams.is_empty() {
        tabs.push(UiTab {
            id: "logs".into(),
            title: "Logs".into(),
            widgets: log_streams
                .iter()
                .map(|log| Widget::Log {
                    title: Some(log.title.clone()),
                    stream: log.stream.clone(),
                    show_path: None,
                    open_path_button: None,
                    copy_path_button: None,
                })
                .collect(),
            children: Vec::new(),
        });
    }
    if !actions.is_empty() {
        tabs.push(UiTab {
            id: "actions".into(),
            title: "Actions".into(),
            widgets: actions
                .iter()
                .map(|action| Widget::Button {
                    label: Some(action.label.clone()),
                    action: action.name.clone(),
                })
                .collect(),
            children: Vec::new(),
        });
    }
    if tabs.is_empty() {
        tabs.push(UiTab {
            id: "status".into(),
            title: "Status".into(),
            ..UiTab::default()
        });
    }
    tabs
}
