//! Scripted gateway for tests and local development.
//!
//! Serves `/ws` with the real connect handshake and a few methods whose behavior is chosen by
//! the caller: `ping`, `health`, `slow`, `fail`, `emit`, `drop` and `crash`.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use warden::gateway::{
    ConnectParams, EventFrame, Frame, HelloOk, HelloPolicy, RequestFrame, ResponseFrame,
    CONNECT_CHALLENGE_EVENT, CONNECT_METHOD, HEALTH_METHOD, PROTOCOL_VERSION, SHUTDOWN_EVENT,
};
use warden::token::TOKEN_ENV;

const DEFAULT_SLOW_MS: u64 = 500;
const DEFAULT_CRASH_CODE: i32 = 70;

#[derive(Parser)]
#[command(name = "warden-stub-gateway")]
#[command(about = "Scripted gateway for exercising the Warden supervisor", long_about = None)]
struct Args {
    /// WebSocket and HTTP port
    #[arg(long, short)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Wait this long before binding the port.
    #[arg(long, value_name = "MS", default_value_t = 0)]
    bind_delay_ms: u64,

    /// Never bind the port; run until signalled.
    #[arg(long)]
    never_bind: bool,
}

#[derive(Clone)]
struct StubState {
    /// Required connect token (from WARDEN_GATEWAY_TOKEN); `None` accepts any client.
    token: Option<String>,
    shutdown_tx: broadcast::Sender<String>,
}

/// What to do with one request.
enum Action {
    Send(Vec<Frame>),
    SendAfter(Duration, Frame),
    Close,
    Crash(i32),
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        log::error!("stub gateway failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let token = std::env::var(TOKEN_ENV)
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    let (shutdown_tx, _) = broadcast::channel(4);

    if args.never_bind {
        log::info!("not binding any port");
        shutdown_signal(shutdown_tx).await;
        return Ok(());
    }
    if args.bind_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.bind_delay_ms)).await;
    }

    let state = StubState {
        token,
        shutdown_tx: shutdown_tx.clone(),
    };
    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let bind_addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("stub gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("stub gateway server exited")?;
    log::info!("stub gateway stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM, after telling connected clients we are going away.
async fn shutdown_signal(shutdown_tx: broadcast::Sender<String>) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("no SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
    let shutdown = Frame::Event(EventFrame::new(SHUTDOWN_EVENT, json!({})));
    let _ = shutdown_tx.send(shutdown.to_text());
}

async fn health_http() -> Json<Value> {
    Json(json!({ "runtime": "running", "protocol": PROTOCOL_VERSION }))
}

async fn ws_handler(State(state): State<StubState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: StubState) {
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let (later_tx, mut later_rx) = mpsc::unbounded_channel::<Frame>();
    let mut connected = false;

    let challenge = Frame::Event(EventFrame::new(
        CONNECT_CHALLENGE_EVENT,
        json!({
            "nonce": uuid::Uuid::new_v4().to_string(),
            "ts": chrono::Utc::now().timestamp_millis(),
        }),
    ));
    if socket.send(Message::Text(challenge.to_text())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            shutdown = shutdown_rx.recv() => {
                if let Ok(text) = shutdown {
                    let _ = socket.send(Message::Text(text)).await;
                }
                break;
            }
            Some(frame) = later_rx.recv() => {
                if socket.send(Message::Text(frame.to_text())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(Frame::Req(req)) = Frame::parse(&text) else { continue };

                match respond(&state, &mut connected, req) {
                    Action::Send(frames) => {
                        for frame in frames {
                            let _ = socket.send(Message::Text(frame.to_text())).await;
                        }
                    }
                    Action::SendAfter(delay, frame) => {
                        let later_tx = later_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = later_tx.send(frame);
                        });
                    }
                    Action::Close => {
                        log::info!("closing client connection on request");
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                    Action::Crash(code) => {
                        log::warn!("crashing with exit code {} on request", code);
                        std::process::exit(code);
                    }
                }
            }
        }
    }
}

fn reply(frame: ResponseFrame) -> Action {
    Action::Send(vec![Frame::Res(frame)])
}

fn respond(state: &StubState, connected: &mut bool, req: RequestFrame) -> Action {
    if req.method == CONNECT_METHOD {
        return connect(state, connected, req);
    }
    if !*connected {
        return reply(ResponseFrame::err(
            req.id,
            "NOT_CONNECTED",
            "connect required",
        ));
    }

    let params = &req.params;
    match req.method.as_str() {
        "ping" => reply(ResponseFrame::ok(req.id, json!("pong"))),
        HEALTH_METHOD => reply(ResponseFrame::ok(
            req.id,
            json!({ "runtime": "running", "protocol": PROTOCOL_VERSION }),
        )),
        "slow" => {
            let delay = params
                .get("delayMs")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_SLOW_MS);
            Action::SendAfter(
                Duration::from_millis(delay),
                Frame::Res(ResponseFrame::ok(req.id, json!({ "sleptMs": delay }))),
            )
        }
        "fail" => {
            let code = params.get("code").and_then(Value::as_str).unwrap_or("STUB_FAILURE");
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure");
            reply(ResponseFrame::err(req.id, code, message))
        }
        "emit" => {
            let Some(event) = params.get("event").and_then(Value::as_str) else {
                return reply(ResponseFrame::err(req.id, "BAD_PARAMS", "emit needs an event name"));
            };
            let payload = params.get("payload").cloned().unwrap_or(Value::Null);
            Action::Send(vec![
                Frame::Event(EventFrame::new(event, payload)),
                Frame::Res(ResponseFrame::ok(req.id, json!(true))),
            ])
        }
        "drop" => Action::Close,
        "crash" => Action::Crash(
            params
                .get("code")
                .and_then(Value::as_i64)
                .map(|c| c as i32)
                .unwrap_or(DEFAULT_CRASH_CODE),
        ),
        other => reply(ResponseFrame::err(
            req.id,
            "UNKNOWN_METHOD",
            format!("unknown method: {}", other),
        )),
    }
}

fn connect(state: &StubState, connected: &mut bool, req: RequestFrame) -> Action {
    let params: ConnectParams = match serde_json::from_value(req.params) {
        Ok(p) => p,
        Err(_) => {
            return reply(ResponseFrame::err(req.id, "BAD_PARAMS", "invalid connect params"));
        }
    };
    if let Some(ref required) = state.token {
        let provided = params.auth.token.as_deref().unwrap_or("").trim();
        if provided.is_empty() {
            return reply(ResponseFrame::err(
                req.id,
                "UNAUTHORIZED",
                "unauthorized: gateway token missing",
            ));
        }
        if provided != required {
            return reply(ResponseFrame::err(
                req.id,
                "UNAUTHORIZED",
                "unauthorized: gateway token mismatch",
            ));
        }
    }
    *connected = true;
    let hello = HelloOk {
        typ: "hello-ok".to_string(),
        protocol: params
            .max_protocol
            .unwrap_or(PROTOCOL_VERSION)
            .min(PROTOCOL_VERSION),
        policy: Some(HelloPolicy {
            tick_interval_ms: Some(15_000),
        }),
    };
    reply(ResponseFrame::ok(
        req.id,
        serde_json::to_value(&hello).unwrap_or(json!({})),
    ))
}
