use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tmon_core::config::{StatusCommand, Target};
use tmon_core::control::ControlFailure;
use tmon_core::extract::{extract_json_object, ExtractError};
use tokio::process::Command;

use crate::control_client::ControlClient;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusFetchError {
    #[error("{0}")]
    Control(#[from] ControlFailure),
    #[error("status provider missing")]
    NoProvider,
    #[error("failed to start status command: {0}")]
    Spawn(String),
    #[error("status timeout after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("{0}")]
    Exit(String),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusErrorRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// What the engine knows about one target's status. A failure never clears the last
/// good payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub last_good: Option<Value>,
    pub last_good_at: Option<DateTime<Utc>>,
    pub last_error: Option<StatusErrorRecord>,
}

impl StatusSnapshot {
    pub fn record_success(&mut self, payload: Value) {
        self.last_good = Some(payload);
        self.last_good_at = Some(Utc::now());
        self.last_error = None;
    }

    pub fn record_failure(&mut self, err: &StatusFetchError) {
        self.last_error = Some(StatusErrorRecord {
            at: Utc::now(),
            message: err.to_string(),
        });
    }
}

/// Fetches a status payload over the control channel, or from the legacy status command.
pub async fn fetch_status(target: &Target) -> Result<Value, StatusFetchError> {
    if let Some(control) = &target.control {
        return Ok(ControlClient::from_config(control).status_get().await?);
    }
    match &target.status_command {
        Some(command) => run_status_command(command).await,
        None => Err(StatusFetchError::NoProvider),
    }
}

pub async fn run_status_command(command: &StatusCommand) -> Result<Value, StatusFetchError> {
    let Some((program, rest)) = command.cmd.split_first() else {
        return Err(StatusFetchError::Spawn("status command is empty".into()));
    };
    let mut child = Command::new(program);
    child
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !command.cwd.is_empty() {
        child.current_dir(&command.cwd);
    }
    let child = child
        .spawn()
        .map_err(|err| StatusFetchError::Spawn(err.to_string()))?;

    let output = tokio::time::timeout(command.timeout, child.wait_with_output())
        .await
        .map_err(|_| StatusFetchError::Timeout(command.timeout))?
        .map_err(|err| StatusFetchError::Spawn(err.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!(
                "status command exited rc={}",
                output.status.code().unwrap_or(-1)
            )
        } else {
            stderr
        };
        return Err(StatusFetchError::Exit(message));
    }
    let map = extract_json_object(&String::from_utf8_lossy(&output.stdout))?;
    Ok(Value::Object(map))
}
