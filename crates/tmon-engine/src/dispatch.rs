use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tmon_core::args::{apply_placeholder, apply_placeholders, bind_args, find_unresolved, ArgError, ArgValues};
use tmon_core::config::{ActionSpec, ControlConfig, Target};
use tmon_core::control::{ControlFailure, JobState};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::control_client::ControlClient;
use crate::mutex::MutexRegistry;
use crate::output_log::ActionOutputLog;

const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const SYSTEM_STREAM: &str = "system";

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error(transparent)]
    InvalidArgs(#[from] ArgError),
    #[error("unresolved placeholder {placeholder}")]
    UnresolvedPlaceholder { placeholder: String },
    #[error("no executor: action has no cmd and target has no control channel")]
    NoExecutor,
    #[error("failed to start process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),
    #[error(transparent)]
    Control(#[from] ControlFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Exited { code: i32 },
    Detached,
    TimedOut { after: Duration },
    Job { job_id: String, state: JobState },
}

/// Where an invocation runs, decided once per call after arguments are bound.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionSource<'a> {
    Local { cmd: Vec<String>, cwd: String },
    Remote(&'a ControlConfig),
}

impl<'a> ActionSource<'a> {
    pub fn resolve(
        target: &'a Target,
        action: &ActionSpec,
        args: &ArgValues,
    ) -> Result<Self, ActionError> {
        if action.is_local() {
            let template = action.cmd.iter().map(String::as_str).chain([action.cwd.as_str()]);
            if let Some(placeholder) = find_unresolved(template, args) {
                return Err(ActionError::UnresolvedPlaceholder { placeholder });
            }
            return Ok(ActionSource::Local {
                cmd: apply_placeholders(&action.cmd, args),
                cwd: apply_placeholder(&action.cwd, args),
            });
        }
        target
            .control
            .as_ref()
            .map(ActionSource::Remote)
            .ok_or(ActionError::NoExecutor)
    }
}

/// Runs actions against targets. Every outcome and failure is reported to the target's
/// output log exactly once.
#[derive(Debug, Clone)]
pub struct ActionDispatcher {
    mutexes: Arc<MutexRegistry>,
}

impl ActionDispatcher {
    pub fn new(mutexes: Arc<MutexRegistry>) -> Self {
        Self { mutexes }
    }

    pub fn mutexes(&self) -> &Arc<MutexRegistry> {
        &self.mutexes
    }

    pub async fn invoke(
        &self,
        target: &Target,
        action_name: &str,
        args: &ArgValues,
        last_status: Option<&Value>,
        log: &Arc<ActionOutputLog>,
    ) -> Result<ActionOutcome, ActionError> {
        let action = target
            .action(action_name)
            .ok_or_else(|| ActionError::UnknownAction(action_name.to_string()))?;
        let result = self.run(target, action, args, last_status, log).await;
        match &result {
            Ok(outcome) => info!(
                event = "action_finished",
                target = %target.id,
                action = %action.name,
                outcome = ?outcome
            ),
            Err(err) => {
                warn!(event = "action_failed", target = %target.id, action = %action.name, error = %err);
                log.append(SYSTEM_STREAM, &format!("{}: failed: {err}", action.label));
            }
        }
        result
    }

    async fn run(
        &self,
        target: &Target,
        action: &ActionSpec,
        args: &ArgValues,
        last_status: Option<&Value>,
        log: &Arc<ActionOutputLog>,
    ) -> Result<ActionOutcome, ActionError> {
        let bound = bind_args(action, args, last_status)?;
        let source = ActionSource::resolve(target, action, &bound)?;
        let _guard = self.mutexes.acquire(action.mutex_name.as_deref()).await;
        match source {
            ActionSource::Local { cmd, cwd } => run_local(action, &cmd, &cwd, log).await,
            ActionSource::Remote(control) => run_remote(action, control, &bound, log).await,
        }
    }
}

async fn run_local(
    action: &ActionSpec,
    cmd: &[String],
    cwd: &str,
    log: &Arc<ActionOutputLog>,
) -> Result<ActionOutcome, ActionError> {
    let label = &action.label;
    let Some((program, rest)) = cmd.split_first() else {
        return Err(ActionError::NoExecutor);
    };
    log.append(SYSTEM_STREAM, &format!("running {label}: {}", cmd.join(" ")));

    let mut command = Command::new(program);
    command.args(rest);
    if !cwd.trim().is_empty() {
        command.current_dir(cwd.trim());
    }

    if action.detached {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command.spawn().map_err(ActionError::Spawn)?;
        log.append(SYSTEM_STREAM, &format!("{label}: detached process started"));
        return Ok(ActionOutcome::Detached);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(ActionError::Spawn)?;

    let readers: Vec<_> = [
        child.stdout.take().map(|out| spawn_reader(out, "stdout", log.clone())),
        child.stderr.take().map(|err| spawn_reader(err, "stderr", log.clone())),
    ]
    .into_iter()
    .flatten()
    .collect();

    let (exit, timed_out) = match tokio::time::timeout(action.timeout, child.wait()).await {
        Ok(status) => (status.map_err(ActionError::Wait)?, false),
        Err(_) => {
            if let Err(err) = child.kill().await {
                warn!(event = "action_kill_failed", action = %action.name, error = %err);
            }
            (child.wait().await.map_err(ActionError::Wait)?, true)
        }
    };

    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(READER_JOIN_TIMEOUT, reader).await.is_err() {
            abort.abort();
        }
    }

    if timed_out {
        log.append(
            SYSTEM_STREAM,
            &format!(
                "{label}: timeout after {:.1}s",
                action.timeout.as_secs_f64()
            ),
        );
        return Ok(ActionOutcome::TimedOut {
            after: action.timeout,
        });
    }
    let code = exit.code().unwrap_or(-1);
    log.append(SYSTEM_STREAM, &format!("{label}: finished rc={code}"));
    Ok(ActionOutcome::Exited { code })
}

fn spawn_reader<R>(
    reader: R,
    stream: &'static str,
    log: Arc<ActionOutputLog>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    log.append(stream, text.trim_end_matches(['\r', '\n']));
                }
            }
        }
    })
}

async fn run_remote(
    action: &ActionSpec,
    control: &ControlConfig,
    args: &ArgValues,
    log: &Arc<ActionOutputLog>,
) -> Result<ActionOutcome, ActionError> {
    let label = &action.label;
    let client = ControlClient::from_config(control);
    log.append(
        SYSTEM_STREAM,
        &format!("running {label}: action.invoke {} via {}", action.name, client.endpoint()),
    );
    let job = client.action_invoke(&action.name, args).await?;
    let deadline = Instant::now() + control.job_timeout;

    loop {
        let snapshot = client.job_get(&job.job_id).await?;
        if snapshot.state.is_terminal() {
            for (stream, text) in [("stdout", &snapshot.stdout), ("stderr", &snapshot.stderr)] {
                if let Some(text) = text {
                    for line in text.lines() {
                        log.append(stream, line);
                    }
                }
            }
            log.append(
                SYSTEM_STREAM,
                &format!("{label}: job {} {}", job.job_id, snapshot.state),
            );
            return Ok(ActionOutcome::Job {
                job_id: job.job_id,
                state: snapshot.state,
            });
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(event = "action_job_abandoned", action = %action.name, job_id = %job.job_id);
            log.append(
                SYSTEM_STREAM,
                &format!(
                    "{label}: timeout after {:.1}s",
                    control.job_timeout.as_secs_f64()
                ),
            );
            return Ok(ActionOutcome::TimedOut {
                after: control.job_timeout,
            });
        }
        tokio::time::sleep(control.job_poll.min(deadline - now)).await;
    }
}
