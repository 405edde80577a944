use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tmon_core::args::ArgValues;
use tmon_core::control::JobState;
use tmon_engine::{ActionOutcome, Engine, EngineError, EngineOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct FakeApp {
    mode: String,
    requests: Vec<Value>,
}

async fn launch_fake_app() -> (String, Arc<Mutex<FakeApp>>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let endpoint = listener.local_addr().expect("addr").to_string();
    let state = Arc::new(Mutex::new(FakeApp {
        mode: "fast".into(),
        requests: Vec::new(),
    }));
    let shared = state.clone();
    let server = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let state = shared.clone();
            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut reader = BufReader::new(reader);
                let mut line = Vec::new();
                if reader.read_until(b'\n', &mut line).await.is_err() {
                    return;
                }
                let request: Value = serde_json::from_slice(&line).expect("request json");
                let reply = handle(&state, request);
                let mut frame = serde_json::to_vec(&reply).expect("encode");
                frame.push(b'\n');
                let _ = writer.write_all(&frame).await;
            });
        }
    });
    (endpoint, state, server)
}

fn handle(state: &Mutex<FakeApp>, request: Value) -> Value {
    let mut app = state.lock().expect("state");
    app.requests.push(request.clone());
    let params = &request["params"];
    if params["appId"] != "demo" {
        return json!({"ok": false, "error": {"code": "unknown_app", "message": "unknown app"}});
    }
    let response = match request["method"].as_str().unwrap_or_default() {
        "status.get" => json!({"pid": 4242, "mode": app.mode, "workers": [{"name": "w1"}]}),
        "action.list" => json!({"actions": [{"name": "ping", "label": "Ping"}]}),
        "action.invoke" => json!({"jobId": "job-7"}),
        "action.job.get" => json!({"state": "succeeded", "stdout": "pong\n"}),
        "config.get" => json!({
            "paths": {"root": "/srv/demo"},
            "entries": [{"key": "mode", "value": app.mode, "settable": true,
                         "allowedValues": ["fast", "safe"]}]
        }),
        "config.set" => {
            app.mode = params["value"].as_str().unwrap_or_default().to_string();
            json!({"updated": true})
        }
        other => {
            return json!({"ok": false, "error": {"code": "unknown_method", "message": other}});
        }
    };
    json!({"ok": true, "response": response})
}

fn write_config(dir: &Path, endpoint: &str) -> PathBuf {
    let target = json!({
        "configVersion": 2,
        "id": "demo-app",
        "title": "Demo",
        "control": {"mode": "ipc", "endpoint": endpoint, "appId": "demo",
                    "timeoutSeconds": 2, "jobPollMs": 50, "jobTimeoutSeconds": 5},
        "logs": [{"stream": "app", "glob": dir.join("*.log").display().to_string()}],
        "actions": [{"name": "ping", "label": "Ping"}],
        "ui": {"tabs": [{"id": "status", "title": "Status", "widgets": [
            {"type": "kv", "items": [{"label": "PID", "jsonpath": "$.pid"},
                                     {"label": "Worker", "jsonpath": "$.workers[0].name"}]}
        ]}]}
    });
    std::fs::write(dir.join("demo.json"), target.to_string()).expect("target");
    let root = dir.join("tmon.json");
    std::fs::write(&root, json!({"includeFiles": ["demo.json"]}).to_string()).expect("root");
    root
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_survives_control_outage() {
    let dir = TempDir::new().expect("tempdir");
    let (endpoint, _state, server) = launch_fake_app().await;
    let engine = Engine::load_config(write_config(dir.path(), &endpoint), EngineOptions::default())
        .expect("load");

    let payload = engine.get_status("demo-app").await.expect("status");
    let target = engine.target("demo-app").expect("target");
    let rendered: Vec<String> = target
        .bindings()
        .map(|binding| Engine::resolve_text(&payload, &binding.jsonpath))
        .collect();
    assert_eq!(rendered, vec!["4242", "w1"]);

    server.abort();
    let _ = server.await;
    let err = engine.get_status("demo-app").await.expect_err("outage");
    assert!(matches!(err, EngineError::Status { .. }));

    let snapshot = engine.status_snapshot("demo-app").expect("target");
    assert_eq!(snapshot.last_good.as_ref().map(|value| &value["pid"]), Some(&json!(4242)));
    let error = snapshot.last_error.expect("error recorded");
    assert!(
        error.message.starts_with("connect_failed"),
        "unexpected error {}",
        error.message
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_action_and_config_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let (endpoint, state, _server) = launch_fake_app().await;
    let engine = Engine::load_config(write_config(dir.path(), &endpoint), EngineOptions::default())
        .expect("load");

    let catalog = engine.remote_actions("demo-app").await.expect("actions");
    assert_eq!(catalog.actions.len(), 1);
    assert_eq!(catalog.actions[0].name, "ping");

    let outcome = engine
        .invoke_action("demo-app", "ping", &ArgValues::new())
        .await
        .expect("invoke");
    assert_eq!(
        outcome,
        ActionOutcome::Job {
            job_id: "job-7".into(),
            state: JobState::Succeeded
        }
    );
    let output = engine.action_output("demo-app").expect("output");
    assert!(output.contains("[stdout] pong"));
    assert!(output.ends_with("[system] Ping: job job-7 succeeded"));

    let view = engine.remote_config("demo-app").await.expect("config");
    assert_eq!(view.paths[0].key, "root");
    assert_eq!(view.entries[0].allowed, Some(vec![json!("fast"), json!("safe")]));

    engine
        .set_remote_config("demo-app", "mode", json!("safe"))
        .await
        .expect("set");
    let payload = engine.get_status("demo-app").await.expect("status");
    assert_eq!(payload["mode"], "safe");

    let app = state.lock().expect("state");
    assert!(app
        .requests
        .iter()
        .all(|request| request["params"]["appId"] == "demo"));
    let invoke = app
        .requests
        .iter()
        .find(|request| request["method"] == "action.invoke")
        .expect("invoke request");
    assert_eq!(invoke["params"]["actionName"], "ping");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tail_follows_log_file_created_after_start() {
    let dir = TempDir::new().expect("tempdir");
    let engine = Engine::load_config(
        write_config(dir.path(), "127.0.0.1:9"),
        EngineOptions {
            output_dir: Some(dir.path().join("out")),
            ..EngineOptions::default()
        },
    )
    .expect("load");
    let mut tail = engine.watch_tail("demo-app", "app").expect("stream");
    engine.start();
    std::fs::write(dir.path().join("service.log"), "booted\nready\n").expect("log");

    let render = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            tail.changed().await.expect("sender alive");
            let render = tail.borrow_and_update().clone();
            if render.text.contains("ready") {
                break render;
            }
        }
    })
    .await
    .expect("tail picked up new file");
    assert!(render.path.ends_with("service.log"));
    assert_eq!(
        engine.action_output_path("demo-app").expect("target"),
        Some(dir.path().join("out").join("demo-app.log"))
    );
    engine.shutdown().await;
}
