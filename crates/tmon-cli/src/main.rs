mod sample_server;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tmon_core::args::ArgValues;
use tmon_core::config::{load_config, MonitorConfig};
use tmon_core::control::JobState;
use tmon_engine::{ActionOutcome, Engine, EngineOptions, TailRender};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::MakeWriterExt, EnvFilter};

use crate::sample_server::SampleApp;

const DEFAULT_CONFIG: &str = "monitor_config.json";
const WATCH_POLL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "tmon", about = "Target monitor: status polling, log tails and actions")]
struct Cli {
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[arg(long, global = true, default_value = "")]
    log_dir: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ConfigArg {
    /// Root manifest; falls back to TMON_CONFIG, then monitor_config.json.
    #[arg(long, default_value = "")]
    config: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the configuration, print a summary, then exit.
    Validate(ConfigArg),
    /// Run the engine headless and print status and log changes until Ctrl+C.
    Watch {
        #[command(flatten)]
        config: ConfigArg,
        /// Only watch these targets.
        #[arg(long = "target")]
        targets: Vec<String>,
    },
    /// Run one action and stream its output.
    Invoke {
        #[command(flatten)]
        config: ConfigArg,
        #[arg(long)]
        target: String,
        #[arg(long)]
        action: String,
        /// Action argument as name=value; repeatable.
        #[arg(long = "arg", value_parser = parse_arg_pair)]
        args: Vec<(String, String)>,
    },
    /// Serve a sample application over the control protocol.
    SampleServer {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8777)]
        port: u16,
        #[arg(long, default_value = "sample-app")]
        app_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, &resolve_log_dir(&cli.log_dir));
    match cli.command {
        Command::Validate(config) => validate(&resolve_config_path(&config.config)),
        Command::Watch { config, targets } => {
            watch_targets(&resolve_config_path(&config.config), &targets).await
        }
        Command::Invoke {
            config,
            target,
            action,
            args,
        } => {
            let args: ArgValues = args.into_iter().collect();
            invoke(&resolve_config_path(&config.config), &target, &action, &args).await
        }
        Command::SampleServer { host, port, app_id } => serve_sample(&host, port, &app_id).await,
    }
}

fn validate(path: &Path) -> Result<()> {
    let config = load(path)?;
    print!("{}", summarize(&config));
    Ok(())
}

fn load(path: &Path) -> Result<MonitorConfig> {
    if !path.exists() {
        bail!("Config not found: {}", path.display());
    }
    load_config(path).with_context(|| format!("invalid config {}", path.display()))
}

fn summarize(config: &MonitorConfig) -> String {
    let mut out = format!(
        "config={}\ntargets={}\n",
        config.source_path.display(),
        config.targets.len()
    );
    for target in &config.targets {
        out.push_str(&format!(
            "- {} {} logs={} actions={}\n",
            target.id,
            target.schema_version,
            target.log_streams.len(),
            target.actions.len()
        ));
    }
    out
}

async fn watch_targets(path: &Path, only: &[String]) -> Result<()> {
    let engine = Engine::new(load(path)?, EngineOptions::default());
    let ids: Vec<String> = engine
        .targets()
        .map(|target| target.id.clone())
        .filter(|id| only.is_empty() || only.contains(id))
        .collect();
    if ids.is_empty() {
        bail!("no matching targets in {}", path.display());
    }
    for id in only.iter().filter(|id| !ids.contains(id)) {
        warn!(event = "watch_unknown_target", target = %id);
    }

    for id in &ids {
        let target = engine.target(id)?;
        for stream in &target.log_streams {
            let receiver = engine.watch_tail(id, &stream.stream)?;
            tokio::spawn(print_tail(id.clone(), receiver));
        }
    }
    engine.start();
    info!(event = "watch_start", targets = ids.len());

    let mut ticker = tokio::time::interval(WATCH_POLL);
    let mut seen = vec![None; ids.len()];
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                for (id, last) in ids.iter().zip(seen.iter_mut()) {
                    let snapshot = engine.status_snapshot(id)?;
                    let stamp = (snapshot.last_good_at, snapshot.last_error.as_ref().map(|err| err.at));
                    if last.as_ref() == Some(&stamp) {
                        continue;
                    }
                    *last = Some(stamp);
                    match (&snapshot.last_error, &snapshot.last_good) {
                        (Some(error), _) => println!("[{id}] status error: {}", error.message),
                        (None, Some(payload)) => println!("[{id}] status {payload}"),
                        (None, None) => {}
                    }
                }
            }
        }
    }
    engine.shutdown().await;
    Ok(())
}

async fn print_tail(id: String, mut receiver: watch::Receiver<TailRender>) {
    while receiver.changed().await.is_ok() {
        let render = receiver.borrow_and_update().clone();
        println!("[{id}/{}]\n{}", render.stream, render.text);
    }
}

async fn invoke(path: &Path, target: &str, action: &str, args: &ArgValues) -> Result<()> {
    let engine = Engine::new(load(path)?, EngineOptions::default());
    let spec = engine
        .target(target)?
        .action(action)
        .with_context(|| format!("target '{target}' has no action '{action}'"))?;
    if let Some(confirm) = &spec.confirm_text {
        info!(event = "invoke_confirm_skipped", target = %target, action = %action, confirm = %confirm);
    }
    if let Err(err) = engine.get_status(target).await {
        warn!(event = "invoke_status_unavailable", target = %target, error = %err);
    }

    let mut lines = engine.subscribe_action_output(target)?;
    let printer = tokio::spawn(async move {
        loop {
            match lines.recv().await {
                Ok(line) => println!("{line}"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("... {skipped} output lines skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let outcome = engine.invoke_action(target, action, args).await;
    drop(engine);
    let _ = printer.await;
    match outcome.with_context(|| format!("{target}/{action} failed"))? {
        ActionOutcome::Exited { code } if code != 0 => bail!("{action} exited rc={code}"),
        ActionOutcome::TimedOut { after } => {
            bail!("{action} timed out after {:.1}s", after.as_secs_f64())
        }
        ActionOutcome::Job { job_id, state } if state != JobState::Succeeded => {
            bail!("job {job_id} ended {state}")
        }
        _ => Ok(()),
    }
}

async fn serve_sample(host: &str, port: u16, app_id: &str) -> Result<()> {
    if port == 0 {
        bail!("port must be in range 1..65535");
    }
    let host = if host.trim().is_empty() { "127.0.0.1" } else { host.trim() };
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    println!("sample control server listening on {host}:{port} (appId={app_id})");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(sample_server::run(
        listener,
        Arc::new(SampleApp::new(app_id)),
        shutdown_rx,
    ));
    let _ = tokio::signal::ctrl_c().await;
    shutdown_tx.send_replace(true);
    server.await.context("sample server task failed")??;
    Ok(())
}

fn parse_arg_pair(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("argument name is empty in '{raw}'"));
    }
    Ok((name.to_string(), value.to_string()))
}

fn init_logging(debug: bool, log_dir: &str) {
    let level = if debug {
        "debug".to_string()
    } else {
        env_value("TMON_LOG_LEVEL").unwrap_or_else(|| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let file = match open_log_file(log_dir) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let _ = match file {
        Some(file) => builder.with_writer(io::stderr.and(file)).try_init(),
        None => builder.with_writer(io::stderr).try_init(),
    };
}

/// `<log_dir>/tmon.log` opened for append; no directory means stderr only.
fn open_log_file(log_dir: &str) -> io::Result<Option<Arc<File>>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = Path::new(log_dir.trim());
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("tmon.log"))?;
    Ok(Some(Arc::new(file)))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_config_path(config_flag: &str) -> PathBuf {
    if !config_flag.trim().is_empty() {
        return PathBuf::from(config_flag.trim());
    }
    PathBuf::from(env_value("TMON_CONFIG").unwrap_or_else(|| DEFAULT_CONFIG.to_string()))
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_value("TMON_LOG_DIR").unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn arg_pairs_split_on_first_equals() {
        assert_eq!(
            parse_arg_pair("query=a=b").expect("pair"),
            ("query".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_arg_pair("mode=").expect("pair"),
            ("mode".to_string(), String::new())
        );
        assert!(parse_arg_pair("novalue").is_err());
        assert!(parse_arg_pair("=x").is_err());
    }

    #[test]
    fn explicit_config_flag_wins() {
        assert_eq!(
            resolve_config_path(" custom.json "),
            PathBuf::from("custom.json")
        );
    }

    #[test]
    fn summary_lists_targets_with_schema_version() {
        let dir = TempDir::new().expect("tempdir");
        let include = json!({
            "target": {
                "id": "legacy",
                "statusCommand": ["echo", "{}"],
                "commands": [{"label": "Build", "command": ["make"]}]
            }
        });
        std::fs::write(dir.path().join("legacy.json"), include.to_string()).expect("include");
        let root = dir.path().join("monitor.json");
        std::fs::write(&root, json!({"includeFiles": ["legacy.json"]}).to_string()).expect("root");

        let config = load(&root).expect("load");
        let summary = summarize(&config);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[1], "targets=1");
        assert_eq!(lines[2], "- legacy v1 logs=0 actions=1");

        let missing = load(&dir.path().join("absent.json")).expect_err("missing");
        assert!(missing.to_string().starts_with("Config not found"));
    }
}
