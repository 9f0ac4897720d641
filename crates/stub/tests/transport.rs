//! Integration tests: connect handshake and raw calls against a stub gateway spawned directly.

use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use warden::gateway::{
    gateway_ws_url, Connection, Correlator, Frame, GatewayProcess, LaunchSpec, PROTOCOL_VERSION,
};
use warden::token::{AccessToken, TOKEN_ENV};
use warden::BridgeError;

const STUB: &str = env!("CARGO_BIN_EXE_warden-stub-gateway");

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

/// Spawn the stub requiring `token` and wait until it accepts TCP connections.
async fn spawn_stub(token: &str) -> (GatewayProcess, u16) {
    let port = free_port();
    let mut env = BTreeMap::new();
    env.insert(TOKEN_ENV.to_string(), token.to_string());
    let spec = LaunchSpec {
        executable: STUB.into(),
        args: vec!["--port".into(), port.to_string()],
        env,
        output_lines: 100,
    };
    let process = GatewayProcess::spawn(&spec).expect("spawn stub");
    for _ in 0..200 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return (process, port);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("stub did not listen on {} within 5s", port);
}

#[tokio::test]
async fn handshake_with_matching_token_then_call() {
    let (process, port) = spawn_stub("right-token").await;
    let url = gateway_ws_url("127.0.0.1", port);

    let token = AccessToken::new("right-token");
    let (conn, mut inbound) = Connection::connect(&url, &token, Duration::from_secs(5))
        .await
        .expect("connect");
    assert_eq!(conn.protocol(), PROTOCOL_VERSION);
    assert!(!conn.is_closed());

    let calls = std::sync::Arc::new(Correlator::new());
    let router = {
        let calls = calls.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                if let Frame::Res(res) = frame {
                    calls.resolve(res);
                }
            }
        })
    };
    let pong = calls
        .call(&conn, "ping", json!({}), Duration::from_secs(5))
        .await;
    assert_eq!(pong, Ok(json!("pong")));

    conn.disconnect();
    assert!(conn.is_closed());
    assert!(matches!(
        calls.call(&conn, "ping", json!({}), Duration::from_secs(1)).await,
        Err(BridgeError::TransportClosed(_))
    ));
    let _ = tokio::time::timeout(Duration::from_secs(2), router).await;
    process.terminate(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn wrong_token_is_rejected_during_handshake() {
    let (process, port) = spawn_stub("right-token").await;
    let url = gateway_ws_url("127.0.0.1", port);

    let token = AccessToken::new("wrong-token");
    match Connection::connect(&url, &token, Duration::from_secs(5)).await {
        Err(BridgeError::Connect(msg)) => assert!(msg.contains("mismatch"), "{}", msg),
        other => panic!("expected connect error, got {:?}", other.map(|_| ())),
    }
    let exit = process.terminate(Duration::from_secs(2)).await;
    if cfg!(unix) {
        assert!(exit.success(), "stub should exit cleanly on SIGTERM: {}", exit);
    }
}
