use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use warden::config::{self, SupervisorOptions};
use warden::gateway::{BridgeEvent, Supervisor, Topic};
use warden::Outcome;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Warden CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Start the gateway and print its status changes and events until Ctrl+C, then stop it.
    Run {
        /// Config file path (default: WARDEN_CONFIG_PATH or ~/.warden/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Print events as JSON lines.
        #[arg(long)]
        json: bool,

        /// Print the embed URL (contains the access token) once running.
        #[arg(long)]
        embed_url: bool,
    },

    /// Start the gateway, call one method, print the result and stop.
    Call {
        /// Config file path (default: WARDEN_CONFIG_PATH or ~/.warden/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Gateway method, e.g. "status".
        method: String,

        /// Params as JSON (default: {}).
        params: Option<String>,

        /// Call timeout (default from config, 30000).
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Print `{ success, data, error }` JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start the gateway, run a health probe, print the report and stop.
    Health {
        /// Config file path (default: WARDEN_CONFIG_PATH or ~/.warden/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Print `{ success, data, error }` JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start the gateway, print its status, pid and a health probe, then stop.
    Status {
        /// Config file path (default: WARDEN_CONFIG_PATH or ~/.warden/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start the gateway and print the URL (with access token) for embedding its web UI.
    /// Keeps the gateway running until Ctrl+C, since the URL is only valid while it runs.
    EmbedUrl {
        /// Config file path (default: WARDEN_CONFIG_PATH or ~/.warden/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Print `{ url, port, token }` JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the resolved config path and gateway settings.
    Config {
        /// Config file path (default: WARDEN_CONFIG_PATH or ~/.warden/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("warden {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Run {
            config,
            json,
            embed_url,
        }) => {
            if let Err(e) = run_gateway(config, json, embed_url).await {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Call {
            config,
            method,
            params,
            timeout_ms,
            json,
        }) => match run_call(config, &method, params, timeout_ms, json).await {
            Ok(true) => {}
            Ok(false) => std::process::exit(1),
            Err(e) => {
                log::error!("call failed: {:#}", e);
                std::process::exit(1);
            }
        },
        Some(Commands::Health { config, json }) => match run_health(config, json).await {
            Ok(true) => {}
            Ok(false) => std::process::exit(1),
            Err(e) => {
                log::error!("health failed: {:#}", e);
                std::process::exit(1);
            }
        },
        Some(Commands::Status { config, json }) => match run_status(config, json).await {
            Ok(true) => {}
            Ok(false) => std::process::exit(1),
            Err(e) => {
                log::error!("status failed: {:#}", e);
                std::process::exit(1);
            }
        },
        Some(Commands::EmbedUrl { config, json }) => {
            if let Err(e) = run_embed_url(config, json).await {
                log::error!("embed-url failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Config { config }) => {
            if let Err(e) = show_config(config) {
                log::error!("config failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn load_supervisor(config_path: Option<PathBuf>) -> anyhow::Result<Supervisor> {
    let (config, path) = config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    Supervisor::from_config(&config)
}

async fn run_gateway(
    config_path: Option<PathBuf>,
    json: bool,
    embed_url: bool,
) -> anyhow::Result<()> {
    let sup = load_supervisor(config_path)?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for topic in Topic::ALL {
        let tx = tx.clone();
        sup.subscribe(topic, move |e| {
            let _ = tx.send(e.clone());
        });
    }

    sup.start().await.context("starting gateway")?;
    if embed_url {
        if let Some(embed) = sup.embed_info() {
            println!("embed url: {}", embed.url);
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(event) => print_event(&event, json),
                None => break,
            },
        }
    }

    sup.stop().await;
    while let Ok(event) = rx.try_recv() {
        print_event(&event, json);
    }
    Ok(())
}

fn print_event(event: &BridgeEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => log::warn!("encoding {} event: {}", event.topic(), e),
        }
        return;
    }
    match event {
        BridgeEvent::Status(status) => println!("status: {}", status),
        BridgeEvent::Exit(exit) => println!("exit: {}", exit),
        BridgeEvent::Error(message) => println!("error: {}", message),
        BridgeEvent::ChatMessage(msg) => {
            println!("[{}] {}: {}", msg.session_id, msg.role, msg.content)
        }
        BridgeEvent::Message(payload)
        | BridgeEvent::Notification(payload)
        | BridgeEvent::ChannelStatus(payload) => println!("{}: {}", event.topic(), payload),
    }
}

async fn run_call(
    config_path: Option<PathBuf>,
    method: &str,
    params: Option<String>,
    timeout_ms: Option<u64>,
    json: bool,
) -> anyhow::Result<bool> {
    let params: Value = match params {
        Some(p) => serde_json::from_str(&p).with_context(|| format!("parsing params {}", p))?,
        None => json!({}),
    };
    let sup = load_supervisor(config_path)?;
    let result = match sup.start().await {
        Ok(()) => {
            sup.rpc(method, params, timeout_ms.map(Duration::from_millis))
                .await
        }
        Err(e) => Err(e),
    };
    sup.stop().await;
    Ok(print_outcome(result.into(), json))
}

async fn run_health(config_path: Option<PathBuf>, json: bool) -> anyhow::Result<bool> {
    let sup = load_supervisor(config_path)?;
    let result = match sup.start().await {
        Ok(()) => sup.check_health().await.map(|report| {
            json!({ "latencyMs": report.latency_ms, "payload": report.payload })
        }),
        Err(e) => Err(e),
    };
    sup.stop().await;
    Ok(print_outcome(result.into(), json))
}

fn print_outcome(outcome: Outcome<Value>, json: bool) -> bool {
    if json {
        match serde_json::to_string_pretty(&outcome) {
            Ok(s) => println!("{}", s),
            Err(e) => log::warn!("encoding outcome: {}", e),
        }
    } else if let Some(ref data) = outcome.data {
        println!(
            "{}",
            serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string())
        );
    } else if let Some(ref error) = outcome.error {
        eprintln!("error: {}", error);
    }
    outcome.success
}

/// Status snapshot plus the connection and process behind it.
fn status_report(sup: &Supervisor) -> Value {
    json!({
        "status": sup.status(),
        "connected": sup.is_connected(),
        "pid": sup.pid(),
    })
}

async fn run_status(config_path: Option<PathBuf>, json: bool) -> anyhow::Result<bool> {
    let sup = load_supervisor(config_path)?;
    let started = sup.start().await;
    let mut report = status_report(&sup);
    if started.is_ok() {
        report["health"] = match sup.check_health().await {
            Ok(health) => serde_json::to_value(&health)?,
            Err(e) => json!({ "error": e.to_string() }),
        };
    }
    sup.stop().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("status: {}", report["status"]["state"].as_str().unwrap_or("unknown"));
        if let Some(port) = report["status"]["port"].as_u64() {
            println!("port: {}", port);
        }
        if let Some(error) = report["status"]["error"].as_str() {
            println!("error: {}", error);
        }
        println!("connected: {}", report["connected"]);
        println!("pid: {}", report["pid"]);
        if let Some(latency) = report["health"]["latencyMs"].as_u64() {
            println!("health: ok ({}ms)", latency);
        } else if let Some(error) = report["health"]["error"].as_str() {
            println!("health: {}", error);
        }
    }
    Ok(started.is_ok())
}

async fn run_embed_url(config_path: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let sup = load_supervisor(config_path)?;
    sup.start().await.context("starting gateway")?;
    let embed = sup.embed_info().context("gateway is not running")?;
    if json {
        println!("{}", serde_json::to_string(&embed)?);
    } else {
        println!("{}", embed.url);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = wait_until_not_running(&sup) => log::warn!("gateway {}", sup.status()),
    }
    sup.stop().await;
    Ok(())
}

async fn wait_until_not_running(sup: &Supervisor) {
    let mut rx = sup.watch_status();
    let _ = rx.wait_for(|s| !s.is_running()).await;
}

fn show_config(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    let options = SupervisorOptions::from_config(&config.gateway);
    println!("config: {}", path.display());
    println!("executable: {}", options.executable.display());
    println!("args: {:?}", options.args);
    println!("bind: {}", options.bind);
    if options.port == 0 {
        println!("port: any free port");
    } else {
        println!("port: {}", options.port);
    }
    println!(
        "timeouts: startup {}ms, connect {}ms, call {}ms, health {}ms, grace {}ms",
        options.startup_timeout.as_millis(),
        options.connect_timeout.as_millis(),
        options.call_timeout.as_millis(),
        options.health_timeout.as_millis(),
        options.grace.as_millis()
    );
    let env_keys: Vec<&String> = options.env.keys().collect();
    println!("extra env: {:?}", env_keys);
    let providers: Vec<&String> = config.providers.keys().collect();
    println!("providers: {:?}", providers);
    println!(
        "token: {}",
        if config::resolve_gateway_token(&config).is_some() {
            "configured"
        } else {
            "generated per run"
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use warden::secrets::NoSecrets;
    use warden::token::AccessToken;

    #[test]
    fn status_and_embed_url_subcommands_parse() {
        let cli = Cli::try_parse_from(["warden", "status", "--json"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Status { json: true, .. })));

        let cli = Cli::try_parse_from(["warden", "embed-url", "-c", "/tmp/w.json"]).unwrap();
        match cli.command {
            Some(Commands::EmbedUrl { config, json }) => {
                assert_eq!(config, Some(PathBuf::from("/tmp/w.json")));
                assert!(!json);
            }
            _ => panic!("expected embed-url"),
        }
    }

    #[test]
    fn status_report_of_idle_gateway() {
        let sup = Supervisor::new(
            SupervisorOptions::for_executable("/nonexistent/gateway"),
            AccessToken::new("t"),
            Arc::new(NoSecrets),
        );
        let report = status_report(&sup);
        assert_eq!(report["status"]["state"], "stopped");
        assert_eq!(report["status"].get("port"), None);
        assert_eq!(report["connected"], false);
        assert!(report["pid"].is_null());
    }
}
