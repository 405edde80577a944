use std::path::PathBuf;
use std::time::Duration;
use tmon_core::config::{
    ActionOutputLimits, ActionSpec, ControlConfig, SchemaVersion, Target,
};

pub(crate) fn action(name: &str, cmd: &[&str]) -> ActionSpec {
    ActionSpec {
        name: name.to_string(),
        label: name.to_string(),
        cwd: String::new(),
        cmd: cmd.iter().map(|part| part.to_string()).collect(),
        timeout: Duration::from_secs(10),
        confirm_text: None,
        show_output_panel: true,
        mutex_name: None,
        detached: false,
        args: Vec::new(),
    }
}

pub(crate) fn control(endpoint: &str) -> ControlConfig {
    ControlConfig {
        endpoint: endpoint.to_string(),
        app_id: "demo".to_string(),
        timeout: Duration::from_secs(2),
        job_poll: Duration::from_millis(50),
        job_timeout: Duration::from_secs(5),
    }
}

pub(crate) fn target(id: &str, actions: Vec<ActionSpec>) -> Target {
    Target {
        id: id.to_string(),
        title: id.to_string(),
        refresh: Duration::from_secs(1),
        schema_version: SchemaVersion::V2,
        control: None,
        status_command: None,
        log_streams: Vec::new(),
        actions,
        action_output: ActionOutputLimits::default(),
        ui: Vec::new(),
        source_path: PathBuf::from("targets.json"),
    }
}
