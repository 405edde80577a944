use serde_json::{Map, Value};

use super::ConfigError;

pub const ROOT_KEYS: &[&str] = &[
    "refreshSeconds",
    "commandTimeoutSeconds",
    "actionOutput",
    "includeFiles",
];
pub const ACTION_OUTPUT_KEYS: &[&str] = &["maxLines", "maxBytes"];

pub const V1_INCLUDE_KEYS: &[&str] = &["configVersion", "target", "targets", "logPanels"];
pub const V1_TARGET_KEYS: &[&str] = &[
    "id",
    "name",
    "title",
    "cwd",
    "statusCommand",
    "statusTimeoutSeconds",
    "refreshSeconds",
    "commands",
    "fields",
];
pub const V1_COMMAND_KEYS: &[&str] = &[
    "name",
    "label",
    "command",
    "cwd",
    "timeoutSeconds",
    "confirm",
    "showOutputPanel",
    "mutex",
    "detached",
];
pub const V1_FIELD_KEYS: &[&str] = &["key", "label"];
pub const V1_LOG_PANEL_KEYS: &[&str] = &["name", "path", "tailLines"];

pub const V2_CONTAINER_KEYS: &[&str] = &["configVersion", "target", "targets"];
pub const V2_TARGET_KEYS: &[&str] = &[
    "configVersion",
    "id",
    "title",
    "refreshSeconds",
    "control",
    "logs",
    "actions",
    "ui",
    "actionOutput",
];
pub const V2_CONTROL_KEYS: &[&str] = &[
    "mode",
    "endpoint",
    "appId",
    "timeoutSeconds",
    "jobPollMs",
    "jobTimeoutSeconds",
];
pub const V2_LOG_KEYS: &[&str] = &[
    "stream",
    "title",
    "glob",
    "tailLines",
    "maxLineBytes",
    "pollMs",
    "encoding",
    "allowMissing",
];
pub const V2_ACTION_KEYS: &[&str] = &[
    "name",
    "label",
    "cwd",
    "cmd",
    "timeoutSeconds",
    "confirm",
    "showOutputPanel",
    "mutex",
    "detached",
    "args",
];
pub const V2_ARG_KEYS: &[&str] = &[
    "name",
    "label",
    "required",
    "type",
    "pattern",
    "options",
    "optionsJsonpath",
    "placeholder",
];
pub const V2_UI_KEYS: &[&str] = &["tabs"];
pub const V2_TAB_KEYS: &[&str] = &["id", "title", "widgets", "children"];
pub const BINDING_KEYS: &[&str] = &["label", "jsonpath"];

/// Allowed keys for each widget type, `None` for an unknown type.
pub fn widget_keys(widget_type: &str) -> Option<&'static [&'static str]> {
    let keys: &'static [&'static str] = match widget_type {
        "kv" => &["type", "title", "items"],
        "table" => &["type", "title", "columns"],
        "log" => &[
            "type",
            "title",
            "stream",
            "showPath",
            "openPathButton",
            "copyPathButton",
        ],
        "button" => &["type", "label", "action"],
        "profile_select" => &[
            "type",
            "title",
            "action",
            "optionsJsonpath",
            "currentJsonpath",
            "emptyLabel",
            "applyLabel",
        ],
        "action_map" => &[
            "type",
            "title",
            "includeCommands",
            "showActionName",
            "includePrefix",
        ],
        "action_select" => &[
            "type",
            "title",
            "includePrefix",
            "includeRegex",
            "emptyLabel",
            "runLabel",
            "showCommand",
        ],
        "file_view" => &[
            "type",
            "title",
            "pathJsonpath",
            "pathLiteral",
            "maxBytes",
            "encoding",
        ],
        "config_editor" => &["type", "title", "showAction", "setAction", "pathKey"],
        "config_file_select" => &[
            "type",
            "title",
            "showAction",
            "setAction",
            "pathKey",
            "key",
        ],
        "action_output" => &["type", "title"],
        _ => return None,
    };
    Some(keys)
}

/// Rejects keys outside `allowed`. `$schema` and `x-` prefixed keys are always tolerated.
pub fn assert_allowed_keys(
    object: &Map<String, Value>,
    allowed: &[&str],
    context: &str,
) -> Result<(), ConfigError> {
    let mut extras: Vec<String> = object
        .keys()
        .filter(|key| {
            !allowed.contains(&key.as_str()) && key.as_str() != "$schema" && !key.starts_with("x-")
        })
        .cloned()
        .collect();
    if extras.is_empty() {
        return Ok(());
    }
    extras.sort();
    extras.dedup();
    Err(ConfigError::UnsupportedKeys {
        context: context.to_string(),
        keys: extras,
    })
}

pub fn expect_object<'a>(
    value: &'a Value,
    context: &str,
) -> Result<&'a Map<String, Value>, ConfigError> {
    value
        .as_object()
        .ok_or_else(|| ConfigError::invalid(context, "must be an object"))
}

/// Checks each element of an optional list field against `allowed`.
pub fn check_object_list(
    parent: &Map<String, Value>,
    field: &str,
    allowed: &[&str],
    context: &str,
) -> Result<(), ConfigError> {
    let items = match parent.get(field) {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ConfigError::invalid(format!("{context}.{field}"), "must be a list")),
    };
    for (index, item) in items.iter().enumerate() {
        let item_context = format!("{context}.{field}[{}]", index + 1);
        let object = expect_object(item, &item_context)?;
        assert_allowed_keys(object, allowed, &item_context)?;
    }
    Ok(())
}

pub fn check_optional_object(
    parent: &Map<String, Value>,
    field: &str,
    allowed: &[&str],
    context: &str,
) -> Result<(), ConfigError> {
    match parent.get(field) {
        None | Some(Value::Null) => Ok(()),
        Some(value) => {
            let field_context = format!("{context}.{field}");
            assert_allowed_keys(expect_object(value, &field_context)?, allowed, &field_context)
        }
    }
}

pub fn check_tab(tab: &Value, context: &str) -> Result<(), ConfigError> {
    let object = expect_object(tab, context)?;
    assert_allowed_keys(object, V2_TAB_KEYS, context)?;

    let widgets = object.get("widgets").filter(|value| !value.is_null());
    let children = object.get("children").filter(|value| !value.is_null());
    if widgets.is_none() && children.is_none() {
        return Err(ConfigError::invalid(context, "must define widgets or children"));
    }

    if let Some(widgets) = widgets {
        let widgets = widgets
            .as_array()
            .ok_or_else(|| ConfigError::invalid(format!("{context}.widgets"), "must be a list"))?;
        for (index, widget) in widgets.iter().enumerate() {
            check_widget(widget, &format!("{context}.widgets[{}]", index + 1))?;
        }
    }
    if let Some(children) = children {
        let children = children
            .as_array()
            .ok_or_else(|| ConfigError::invalid(format!("{context}.children"), "must be a list"))?;
        for (index, child) in children.iter().enumerate() {
            check_tab(child, &format!("{context}.children[{}]", index + 1))?;
        }
    }
    Ok(())
}

fn check_widget(widget: &Value, context: &str) -> Result<(), ConfigError> {
    let object = expect_object(widget, context)?;
    let widget_type = object
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    let allowed = widget_keys(widget_type).ok_or_else(|| {
        let shown = if widget_type.is_empty() { "(blank)" } else { widget_type };
        ConfigError::invalid(context, format!("unsupported widget type '{shown}'"))
    })?;
    assert_allowed_keys(object, allowed, context)?;
    match widget_type {
        "kv" => check_object_list(object, "items", BINDING_KEYS, context),
        "table" => check_object_list(object, "columns", BINDING_KEYS, context),
        _ => Ok(()),
    }
}
