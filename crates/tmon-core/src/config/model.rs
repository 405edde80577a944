use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_REFRESH_SECONDS: f64 = 1.0;
pub const MIN_REFRESH_SECONDS: f64 = 0.2;
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: f64 = 10.0;
pub const DEFAULT_ACTION_TIMEOUT_SECONDS: f64 = 120.0;
pub const DEFAULT_ACTION_OUTPUT_MAX_LINES: usize = 1200;
pub const DEFAULT_ACTION_OUTPUT_MAX_BYTES: usize = 1_000_000;
pub const MIN_ACTION_OUTPUT_MAX_BYTES: usize = 1024;
pub const DEFAULT_JOB_POLL_MS: u64 = 250;
pub const MIN_JOB_POLL_MS: u64 = 50;
pub const DEFAULT_TAIL_LINES: usize = 300;
pub const DEFAULT_V1_TAIL_LINES: usize = 120;
pub const DEFAULT_MAX_LINE_BYTES: usize = 4096;
pub const MIN_MAX_LINE_BYTES: usize = 64;
pub const DEFAULT_LOG_POLL_MS: u64 = 500;
pub const MIN_LOG_POLL_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchemaVersion {
    V1,
    V2,
}

impl SchemaVersion {
    pub fn as_u8(&self) -> u8 {
        match self {
            SchemaVersion::V1 => 1,
            SchemaVersion::V2 => 2,
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// Fully normalized configuration: root defaults plus every target from every include.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub source_path: PathBuf,
    pub refresh: Duration,
    pub command_timeout: Duration,
    pub action_output: ActionOutputLimits,
    pub include_files: Vec<PathBuf>,
    pub targets: Vec<Target>,
}

impl MonitorConfig {
    pub fn target(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|target| target.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub id: String,
    pub title: String,
    pub refresh: Duration,
    pub schema_version: SchemaVersion,
    pub control: Option<ControlConfig>,
    pub status_command: Option<StatusCommand>,
    pub log_streams: Vec<LogStreamConfig>,
    pub actions: Vec<ActionSpec>,
    pub action_output: ActionOutputLimits,
    pub ui: Vec<UiTab>,
    pub source_path: PathBuf,
}

impl Target {
    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|action| action.name == name)
    }

    pub fn log_stream(&self, stream: &str) -> Option<&LogStreamConfig> {
        self.log_streams.iter().find(|log| log.stream == stream)
    }

    pub fn widgets(&self) -> Widgets<'_> {
        Widgets::new(&self.ui)
    }

    /// Every JSONPath binding declared by kv/table widgets, in tab order.
    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.widgets().flat_map(Widget::bindings)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlConfig {
    pub endpoint: String,
    pub app_id: String,
    pub timeout: Duration,
    pub job_poll: Duration,
    pub job_timeout: Duration,
}

/// Legacy status provider: a local command whose stdout carries a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusCommand {
    pub cwd: String,
    pub cmd: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogStreamConfig {
    pub stream: String,
    pub title: String,
    pub glob: String,
    pub tail_lines: usize,
    pub max_line_bytes: usize,
    pub poll: Duration,
    pub encoding: TextEncoding,
    pub allow_missing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

impl TextEncoding {
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Latin1 => bytes.iter().map(|byte| char::from(*byte)).collect(),
        }
    }
}

impl FromStr for TextEncoding {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "" | "utf-8" | "utf8" | "utf-8-sig" => Ok(TextEncoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(TextEncoding::Latin1),
            other => Err(format!("unsupported encoding '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub name: String,
    pub label: String,
    pub cwd: String,
    pub cmd: Vec<String>,
    pub timeout: Duration,
    pub confirm_text: Option<String>,
    pub show_output_panel: bool,
    pub mutex_name: Option<String>,
    pub detached: bool,
    pub args: Vec<ActionArg>,
}

impl ActionSpec {
    pub fn is_local(&self) -> bool {
        !self.cmd.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionArg {
    pub name: String,
    pub label: String,
    pub required: bool,
    pub kind: ArgKind,
    pub pattern: Option<String>,
    pub options: ArgOptions,
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Int,
    Float,
    Bool,
}

impl FromStr for ArgKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "" | "string" => Ok(ArgKind::String),
            "int" => Ok(ArgKind::Int),
            "float" => Ok(ArgKind::Float),
            "bool" => Ok(ArgKind::Bool),
            other => Err(format!("unsupported arg type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgOptions {
    None,
    Literal(Vec<String>),
    JsonPath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionOutputLimits {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl ActionOutputLimits {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            max_bytes: max_bytes.max(MIN_ACTION_OUTPUT_MAX_BYTES),
        }
    }
}

impl Default for ActionOutputLimits {
    fn default() -> Self {
        Self::new(DEFAULT_ACTION_OUTPUT_MAX_LINES, DEFAULT_ACTION_OUTPUT_MAX_BYTES)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UiTab {
    pub id: String,
    pub title: String,
    pub widgets: Vec<Widget>,
    pub children: Vec<UiTab>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Binding {
    pub label: String,
    pub jsonpath: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Widget {
    Kv {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        items: Vec<Binding>,
    },
    Table {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        columns: Vec<Binding>,
    },
    Log {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        stream: String,
        #[serde(default)]
        show_path: Option<bool>,
        #[serde(default)]
        open_path_button: Option<bool>,
        #[serde(default)]
        copy_path_button: Option<bool>,
    },
    Button {
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        action: String,
    },
    ProfileSelect {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        options_jsonpath: Option<String>,
        #[serde(default)]
        current_jsonpath: Option<String>,
        #[serde(default)]
        empty_label: Option<String>,
        #[serde(default)]
        apply_label: Option<String>,
    },
    ActionMap {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        include_commands: Vec<String>,
        #[serde(default)]
        show_action_name: Option<bool>,
        #[serde(default)]
        include_prefix: Option<String>,
    },
    ActionSelect {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        include_prefix: Option<String>,
        #[serde(default)]
        include_regex: Option<String>,
        #[serde(default)]
        empty_label: Option<String>,
        #[serde(default)]
        run_label: Option<String>,
        #[serde(default)]
        show_command: Option<bool>,
    },
    FileView {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        path_jsonpath: Option<String>,
        #[serde(default)]
        path_literal: Option<String>,
        #[serde(default)]
        max_bytes: Option<u64>,
        #[serde(default)]
        encoding: Option<String>,
    },
    ConfigEditor {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        show_action: Option<String>,
        #[serde(default)]
        set_action: Option<String>,
        #[serde(default)]
        path_key: Option<String>,
    },
    ConfigFileSelect {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        show_action: Option<String>,
        #[serde(default)]
        set_action: Option<String>,
        #[serde(default)]
        path_key: Option<String>,
        #[serde(default)]
        key: Option<String>,
    },
    ActionOutput {
        #[serde(default)]
        title: Option<String>,
    },
}

impl Widget {
    pub fn bindings(&self) -> &[Binding] {
        match self {
            Widget::Kv { items, .. } => items,
            Widget::Table { columns, .. } => columns,
            _ => &[],
        }
    }

    pub fn stream_ref(&self) -> Option<&str> {
        match self {
            Widget::Log { stream, .. } => Some(stream.as_str()),
            _ => None,
        }
    }

    /// Action names this widget triggers; empty optional references are skipped.
    pub fn action_refs(&self) -> Vec<&str> {
        fn optional(value: &Option<String>) -> Option<&str> {
            value.as_deref().map(str::trim).filter(|name| !name.is_empty())
        }
        match self {
            Widget::Button { action, .. } => vec![action.as_str()],
            Widget::ProfileSelect { action, .. } => optional(action).into_iter().collect(),
            Widget::ActionMap {
                include_commands, ..
            } => include_commands.iter().map(String::as_str).collect(),
            Widget::ConfigEditor {
                show_action,
                set_action,
                ..
            }
            | Widget::ConfigFileSelect {
                show_action,
                set_action,
                ..
            } => optional(show_action)
                .into_iter()
                .chain(optional(set_action))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Depth-first walk over every widget of a tab tree: a tab's own widgets first, then
/// its children in order.
pub struct Widgets<'a> {
    pending: Vec<&'a UiTab>,
    current: std::slice::Iter<'a, Widget>,
}

impl<'a> Widgets<'a> {
    pub fn new(tabs: &'a [UiTab]) -> Self {
        Self {
            pending: tabs.iter().rev().collect(),
            current: [].iter(),
        }
    }
}

impl<'a> Iterator for Widgets<'a> {
    type Item = &'a Widget;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(widget) = self.current.next() {
                return Some(widget);
            }
            let tab = self.pending.pop()?;
            self.pending.extend(tab.children.iter().rev());
            self.current = tab.widgets.iter();
        }
    }
}
