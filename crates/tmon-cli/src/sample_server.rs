use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use tmon_core::args::option_text;
use tmon_core::control::{
    decode_frame, encode_frame, Method, Request, Response, DEFAULT_MAX_REQUEST_BYTES,
    DEFAULT_MAX_RESPONSE_BYTES,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PROFILES: &[&str] = &["sim", "lab", "prod"];
const MODES: &[&str] = &["sim", "live"];

#[derive(Debug)]
struct DemoState {
    profile: String,
    mode: String,
    running: bool,
    last_action: String,
    jobs: HashMap<String, Value>,
}

/// In-memory application behind the sample control server.
#[derive(Debug)]
pub struct SampleApp {
    app_id: String,
    boot_id: String,
    state: Mutex<DemoState>,
}

#[derive(Debug)]
struct RequestError {
    code: &'static str,
    message: String,
}

impl RequestError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn short_hex(len: usize) -> String {
    Uuid::new_v4().simple().to_string()[..len].to_string()
}

fn text_param(params: &Map<String, Value>, key: &str) -> String {
    params
        .get(key)
        .map(option_text)
        .unwrap_or_default()
        .trim()
        .to_string()
}

impl SampleApp {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            boot_id: format!("boot-{}", short_hex(8)),
            state: Mutex::new(DemoState {
                profile: "sim".into(),
                mode: "sim".into(),
                running: true,
                last_action: "-".into(),
                jobs: HashMap::new(),
            }),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DemoState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answers one decoded request.
    pub fn handle(&self, request: &Request) -> Response {
        let params = request.params.as_object().cloned().unwrap_or_default();
        let result = match request.method.parse::<Method>() {
            Ok(method) => self.dispatch(method, &params),
            Err(message) => Err(RequestError::new("unsupported_method", message)),
        };
        match result {
            Ok(payload) => Response::success(payload),
            Err(err) => Response::failure(err.code, err.message),
        }
    }

    fn dispatch(&self, method: Method, params: &Map<String, Value>) -> Result<Value, RequestError> {
        match method {
            Method::StatusGet => Ok(self.status_payload()),
            Method::ActionList => Ok(json!({"actions": action_catalog()})),
            Method::ActionInvoke => {
                let action_name = text_param(params, "actionName");
                if action_name.is_empty() {
                    return Err(RequestError::new("invalid_params", "actionName is required"));
                }
                let args = params
                    .get("args")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let job_id = self.invoke_action(&action_name, &args)?;
                Ok(json!({"jobId": job_id}))
            }
            Method::ActionJobGet => {
                let job_id = text_param(params, "jobId");
                if job_id.is_empty() {
                    return Err(RequestError::new("invalid_params", "jobId is required"));
                }
                self.state()
                    .jobs
                    .get(&job_id)
                    .cloned()
                    .ok_or_else(|| RequestError::new("invalid_job", format!("unknown jobId: {job_id}")))
            }
            Method::ConfigGet => Ok(self.config_payload()),
            Method::ConfigSet => {
                let key = text_param(params, "key");
                if key.is_empty() {
                    return Err(RequestError::new("invalid_params", "key is required"));
                }
                self.set_config_value(&key, &text_param(params, "value"))?;
                Ok(json!({"updated": true}))
            }
        }
    }

    fn status_payload(&self) -> Value {
        let state = self.state();
        json!({
            "interfaceName": "generic-process-interface",
            "interfaceVersion": 1,
            "appId": self.app_id,
            "appTitle": "Sample App",
            "bootId": self.boot_id,
            "running": state.running,
            "pid": Value::Null,
            "hostRunning": true,
            "profile": state.profile,
            "mode": state.mode,
            "lastAction": state.last_action,
            "timestampUtc": now_utc(),
        })
    }

    fn config_payload(&self) -> Value {
        let state = self.state();
        let profile_path = format!("/srv/demo/config/profiles/{}.json", state.profile);
        json!({
            "paths": [{"key": "profilePath", "value": profile_path}],
            "entries": [
                {"key": "profile", "value": state.profile, "settable": true,
                 "allowed": PROFILES, "path": profile_path},
                {"key": "mode", "value": state.mode, "settable": true, "allowed": MODES},
            ]
        })
    }

    fn set_config_value(&self, key: &str, value: &str) -> Result<(), RequestError> {
        let mut state = self.state();
        let (slot, allowed) = match key {
            "profile" => (&mut state.profile, PROFILES),
            "mode" => (&mut state.mode, MODES),
            other => {
                return Err(RequestError::new("invalid_config", format!("unknown key: {other}")))
            }
        };
        if !allowed.contains(&value) {
            return Err(RequestError::new(
                "invalid_config",
                format!("{key} must be one of {}", allowed.join("|")),
            ));
        }
        *slot = value.to_string();
        state.last_action = format!("config.set {key}={value}");
        Ok(())
    }

    fn invoke_action(&self, action_name: &str, args: &Map<String, Value>) -> Result<String, RequestError> {
        let mut state = self.state();
        let stdout = match action_name {
            "ping" => {
                let message = args
                    .get("value")
                    .map(option_text)
                    .filter(|text| !text.is_empty())
                    .unwrap_or_else(|| "hello".to_string());
                format!("pong: {message}")
            }
            "toggle_running" => {
                state.running = !state.running;
                format!("running={}", state.running)
            }
            other => {
                return Err(RequestError::new("invalid_action", format!("unknown action: {other}")))
            }
        };
        state.last_action = action_name.to_string();
        let job_id = format!("job-{}", short_hex(12));
        state.jobs.insert(
            job_id.clone(),
            json!({
                "jobId": job_id,
                "state": "succeeded",
                "stdout": stdout,
                "stderr": "",
                "finishedAtUtc": now_utc(),
            }),
        );
        Ok(job_id)
    }
}

fn action_catalog() -> Value {
    json!([
        {"name": "ping", "label": "Ping", "args": [
            {"name": "value", "label": "Message", "required": false, "type": "string",
             "placeholder": "hello"}
        ]},
        {"name": "toggle_running", "label": "Toggle Running", "args": []},
    ])
}

/// Accepts connections on `listener` until shutdown; one request line per connection.
pub async fn run(
    listener: TcpListener,
    app: Arc<SampleApp>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    info!(
        event = "sample_server_start",
        addr = %listener.local_addr()?,
        app_id = %app.app_id()
    );
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, peer)) => {
                        debug!(event = "sample_server_accept", peer = %peer);
                        let app = app.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, &app).await {
                                warn!(event = "sample_server_connection_error", error = %err);
                            }
                        });
                    }
                    Err(err) => {
                        warn!(event = "sample_server_accept_error", error = %err);
                    }
                }
            }
        }
    }
    info!(event = "sample_server_stop", app_id = %app.app_id());
    Ok(())
}

async fn handle_connection(stream: TcpStream, app: &SampleApp) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let limit = DEFAULT_MAX_REQUEST_BYTES as u64 + 1;
    let mut reader = BufReader::new(reader.take(limit));
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Ok(());
    }

    let response = match decode_frame::<Request>(&line, DEFAULT_MAX_REQUEST_BYTES) {
        Ok(request) => {
            debug!(event = "sample_server_request", method = %request.method);
            app.handle(&request)
        }
        Err(err) => Response::failure("invalid_json", format!("invalid JSON request: {err}")),
    };
    let frame = encode_frame(&response, DEFAULT_MAX_RESPONSE_BYTES)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tmon_core::args::ArgValues;
    use tmon_core::control::JobState;
    use tmon_engine::ControlClient;

    async fn launch(app_id: &str) -> (String, watch::Sender<bool>, tokio::task::JoinHandle<io::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = listener.local_addr().expect("addr").to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(listener, Arc::new(SampleApp::new(app_id)), shutdown_rx));
        (endpoint, shutdown_tx, handle)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serves_status_and_actions_to_the_client() {
        let (endpoint, shutdown, handle) = launch("sample-app").await;
        let client = ControlClient::new(&endpoint, "sample-app", Duration::from_secs(2));

        let status = client.status_get().await.expect("status");
        assert_eq!(status["appId"], "sample-app");
        assert_eq!(status["running"], true);

        let mut args = ArgValues::new();
        args.insert("value".into(), "there".into());
        let job = client.action_invoke("ping", &args).await.expect("invoke");
        assert!(job.job_id.starts_with("job-"));
        assert_eq!(job.job_id.len(), "job-".len() + 12);
        let snapshot = client.job_get(&job.job_id).await.expect("job");
        assert_eq!(snapshot.state, JobState::Succeeded);
        assert_eq!(snapshot.stdout.as_deref(), Some("pong: there"));

        client
            .action_invoke("toggle_running", &ArgValues::new())
            .await
            .expect("toggle");
        let status = client.status_get().await.expect("status");
        assert_eq!(status["running"], false);
        assert_eq!(status["lastAction"], "toggle_running");

        shutdown.send_replace(true);
        handle.await.expect("join").expect("server");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn config_set_validates_allowed_values() {
        let (endpoint, shutdown, handle) = launch("sample-app").await;
        let client = ControlClient::new(&endpoint, "sample-app", Duration::from_secs(2));

        client.config_set("profile", json!("lab")).await.expect("set");
        let view = client.config_get().await.expect("config");
        let profile = view
            .entries
            .iter()
            .find(|entry| entry.key == "profile")
            .expect("profile entry");
        assert_eq!(profile.value, json!("lab"));
        assert_eq!(view.paths[0].key, "profilePath");

        let failure = client.config_set("mode", json!("turbo")).await.expect_err("rejected");
        assert_eq!(failure.code, "invalid_config");
        assert_eq!(failure.message, "mode must be one of sim|live");

        let failure = client.job_get("job-missing").await.expect_err("unknown job");
        assert_eq!(failure.code, "invalid_job");

        shutdown.send_replace(true);
        handle.await.expect("join").expect("server");
    }

    #[test]
    fn unknown_method_and_bad_action_are_reported() {
        let app = SampleApp::new("sample-app");
        let response = app.handle(&Request {
            method: "status.delete".into(),
            params: json!({}),
        });
        assert_eq!(
            response.error.map(|error| error.code),
            Some("unsupported_method".to_string())
        );

        let response = app.handle(&Request::new(
            Method::ActionInvoke,
            json!({"actionName": "explode"}),
        ));
        let error = response.error.expect("error");
        assert_eq!(error.code, "invalid_action");
        assert_eq!(error.message, "unknown action: explode");
    }
}
