use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tmon_core::args::ArgValues;
use tmon_core::config::{load_config, ConfigError, MonitorConfig, Target};
use tmon_core::control::{ActionCatalog, ConfigView, ControlFailure};
use tmon_core::jsonpath;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control_client::ControlClient;
use crate::dispatch::{ActionDispatcher, ActionError, ActionOutcome};
use crate::log_tail::{spawn_tail_task, LogTailer, TailRender};
use crate::mutex::MutexRegistry;
use crate::output_log::{sanitize_file_stem, ActionOutputLog};
use crate::scheduler::{PassOutcome, RefreshScheduler};
use crate::status::{fetch_status, StatusFetchError, StatusSnapshot};

pub const ACTION_OUTPUT_DIR: &str = "action-output";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown target '{0}'")]
    UnknownTarget(String),
    #[error("target '{target}' has no log stream '{stream}'")]
    UnknownStream { target: String, stream: String },
    #[error("target '{0}' has no control channel")]
    NoControl(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("status unavailable for '{target}': {source}")]
    Status {
        target: String,
        #[source]
        source: StatusFetchError,
    },
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Control(#[from] ControlFailure),
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Directory for action output mirror files. Defaults to `action-output/` next to
    /// the root manifest.
    pub output_dir: Option<PathBuf>,
    /// Shared mutex-name registry; a fresh one is created when absent.
    pub mutexes: Option<Arc<MutexRegistry>>,
}

#[derive(Debug)]
struct TargetRuntime {
    target: Arc<Target>,
    status: Mutex<StatusSnapshot>,
    output: Arc<ActionOutputLog>,
    tails: BTreeMap<String, watch::Sender<TailRender>>,
}

impl TargetRuntime {
    fn new(target: Target, output_dir: &Path) -> Self {
        let mirror = output_dir.join(format!("{}.log", sanitize_file_stem(&target.id)));
        let output = Arc::new(ActionOutputLog::new(target.action_output, Some(mirror)));
        let tails = target
            .log_streams
            .iter()
            .map(|config| {
                let (sender, _) = watch::channel(TailRender::pending(config));
                (config.stream.clone(), sender)
            })
            .collect();
        Self {
            target: Arc::new(target),
            status: Mutex::new(StatusSnapshot::default()),
            output,
            tails,
        }
    }

    fn status(&self) -> std::sync::MutexGuard<'_, StatusSnapshot> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tail(&self, stream: &str) -> Result<&watch::Sender<TailRender>, EngineError> {
        self.tails.get(stream).ok_or_else(|| EngineError::UnknownStream {
            target: self.target.id.clone(),
            stream: stream.to_string(),
        })
    }

    async fn refresh(&self) -> Result<Value, StatusFetchError> {
        let result = fetch_status(&self.target).await;
        let mut status = self.status();
        match &result {
            Ok(payload) => {
                debug!(event = "status_refresh_ok", target = %self.target.id);
                status.record_success(payload.clone());
            }
            Err(err) => {
                warn!(event = "status_refresh_failed", target = %self.target.id, error = %err);
                status.record_failure(err);
            }
        }
        result
    }
}

#[derive(Debug)]
struct EngineInner {
    config: MonitorConfig,
    runtimes: Vec<Arc<TargetRuntime>>,
    dispatcher: ActionDispatcher,
    scheduler: Arc<RefreshScheduler>,
}

impl EngineInner {
    fn runtime(&self, id: &str) -> Result<&Arc<TargetRuntime>, EngineError> {
        self.runtimes
            .iter()
            .find(|runtime| runtime.target.id == id)
            .ok_or_else(|| EngineError::UnknownTarget(id.to_string()))
    }
}

async fn refresh_target(inner: Arc<EngineInner>, id: String) {
    let runtime = match inner.runtime(&id) {
        Ok(runtime) => runtime,
        Err(err) => {
            debug!(event = "scheduled_refresh_skipped", target = %id, error = %err);
            return;
        }
    };
    if let Err(err) = runtime.refresh().await {
        debug!(event = "scheduled_refresh_failed", target = %id, error = %err);
    }
}

/// Consumer-facing handle over a loaded configuration: status polling, log tails and
/// action execution for every target.
#[derive(Debug)]
pub struct Engine {
    inner: Arc<EngineInner>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn load_config(path: impl AsRef<Path>, options: EngineOptions) -> Result<Self, EngineError> {
        let config = load_config(path)?;
        Ok(Self::new(config, options))
    }

    pub fn new(config: MonitorConfig, options: EngineOptions) -> Self {
        let output_dir = options.output_dir.unwrap_or_else(|| {
            config
                .source_path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join(ACTION_OUTPUT_DIR)
        });
        let runtimes: Vec<_> = config
            .targets
            .iter()
            .cloned()
            .map(|target| Arc::new(TargetRuntime::new(target, &output_dir)))
            .collect();
        let scheduler = Arc::new(RefreshScheduler::new(
            runtimes
                .iter()
                .map(|runtime| (runtime.target.id.clone(), runtime.target.refresh)),
        ));
        let dispatcher = ActionDispatcher::new(options.mutexes.unwrap_or_default());
        let (shutdown, _) = watch::channel(false);
        info!(
            event = "engine_loaded",
            config = %config.source_path.display(),
            targets = runtimes.len(),
            output_dir = %output_dir.display()
        );
        Self {
            inner: Arc::new(EngineInner {
                config,
                runtimes,
                dispatcher,
                scheduler,
            }),
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.inner.runtimes.iter().map(|runtime| runtime.target.as_ref())
    }

    pub fn target(&self, id: &str) -> Result<&Target, EngineError> {
        Ok(self.inner.runtime(id)?.target.as_ref())
    }

    /// Starts one tail task per log stream and the refresh ticker. Later calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks();
        for runtime in &self.inner.runtimes {
            for config in &runtime.target.log_streams {
                let Some(sender) = runtime.tails.get(&config.stream) else {
                    continue;
                };
                tasks.push(spawn_tail_task(
                    runtime.target.id.clone(),
                    LogTailer::new(config.clone()),
                    sender.clone(),
                    self.shutdown.subscribe(),
                ));
            }
        }

        let inner = self.inner.clone();
        tasks.push(self.inner.scheduler.clone().spawn(
            move |id| refresh_target(inner.clone(), id),
            self.shutdown.subscribe(),
        ));
        info!(event = "engine_start", tasks = tasks.len());
    }

    /// Fetches status now, records the outcome and returns the fresh payload.
    pub async fn get_status(&self, id: &str) -> Result<Value, EngineError> {
        let runtime = self.inner.runtime(id)?;
        runtime.refresh().await.map_err(|source| EngineError::Status {
            target: id.to_string(),
            source,
        })
    }

    pub fn cached_status(&self, id: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.inner.runtime(id)?.status().last_good.clone())
    }

    pub fn status_snapshot(&self, id: &str) -> Result<StatusSnapshot, EngineError> {
        Ok(self.inner.runtime(id)?.status().clone())
    }

    pub fn resolve<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
        jsonpath::resolve(payload, path)
    }

    /// Display text for `path` in `payload`; missing values render as `-`.
    pub fn resolve_text(payload: &Value, path: &str) -> String {
        jsonpath::render_value(jsonpath::resolve(payload, path))
    }

    pub async fn invoke_action(
        &self,
        id: &str,
        action_name: &str,
        args: &ArgValues,
    ) -> Result<ActionOutcome, EngineError> {
        let runtime = self.inner.runtime(id)?;
        let last_status = runtime.status().last_good.clone();
        info!(event = "action_invoke", target = %id, action = %action_name);
        let outcome = self
            .inner
            .dispatcher
            .invoke(
                &runtime.target,
                action_name,
                args,
                last_status.as_ref(),
                &runtime.output,
            )
            .await?;
        Ok(outcome)
    }

    pub fn tail_stream(&self, id: &str, stream: &str) -> Result<TailRender, EngineError> {
        Ok(self.inner.runtime(id)?.tail(stream)?.borrow().clone())
    }

    pub fn watch_tail(
        &self,
        id: &str,
        stream: &str,
    ) -> Result<watch::Receiver<TailRender>, EngineError> {
        Ok(self.inner.runtime(id)?.tail(stream)?.subscribe())
    }

    pub fn action_output(&self, id: &str) -> Result<String, EngineError> {
        Ok(self.inner.runtime(id)?.output.snapshot())
    }

    pub fn clear_action_output(&self, id: &str) -> Result<(), EngineError> {
        self.inner.runtime(id)?.output.clear();
        Ok(())
    }

    pub fn subscribe_action_output(
        &self,
        id: &str,
    ) -> Result<broadcast::Receiver<String>, EngineError> {
        Ok(self.inner.runtime(id)?.output.subscribe())
    }

    pub fn action_output_path(&self, id: &str) -> Result<Option<PathBuf>, EngineError> {
        Ok(self
            .inner
            .runtime(id)?
            .output
            .mirror_path()
            .map(Path::to_path_buf))
    }

    /// Refreshes every target now, unless a pass is already running.
    pub async fn refresh_now(&self) -> PassOutcome {
        let inner = self.inner.clone();
        let fetch = move |id| refresh_target(inner.clone(), id);
        self.inner.scheduler.mark_all_due();
        self.inner.scheduler.run_pass(&fetch).await
    }

    fn control_client(&self, id: &str) -> Result<ControlClient, EngineError> {
        let runtime = self.inner.runtime(id)?;
        runtime
            .target
            .control
            .as_ref()
            .map(ControlClient::from_config)
            .ok_or_else(|| EngineError::NoControl(id.to_string()))
    }

    pub async fn remote_actions(&self, id: &str) -> Result<ActionCatalog, EngineError> {
        Ok(self.control_client(id)?.action_list().await?)
    }

    pub async fn remote_config(&self, id: &str) -> Result<ConfigView, EngineError> {
        Ok(self.control_client(id)?.config_get().await?)
    }

    pub async fn set_remote_config(
        &self,
        id: &str,
        key: &str,
        value: Value,
    ) -> Result<Value, EngineError> {
        let client = self.control_client(id)?;
        let result = client.config_set(key, value).await?;
        info!(event = "remote_config_set", target = %id, key = %key);
        Ok(result)
    }

    /// Signals every background task and waits for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(event = "engine_task_join_failed", error = %err);
            }
        }
        info!(event = "engine_stop");
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
