//! WebSocket connection to the gateway: connect handshake, outbound frames, inbound frames, close.
//!
//! The transport checks that frames are well-formed and nothing more. Inbound frames are
//! handed over in arrival order through [`Inbound`]; it ends right after the connection is
//! marked closed.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::BridgeError;
use crate::gateway::protocol::{
    ConnectParams, Frame, HelloOk, RequestFrame, CONNECT_CHALLENGE_EVENT, CONNECT_METHOD,
};
use crate::token::AccessToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Id of the handshake request; call ids from the correlator never take this form.
const HANDSHAKE_ID: &str = "connect";

/// Inbound frames in arrival order. `recv` yields `None` once the connection has closed.
pub type Inbound = mpsc::UnboundedReceiver<Frame>;

/// Live connection to the gateway.
pub struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    closed_tx: Arc<watch::Sender<Option<String>>>,
    closed_rx: watch::Receiver<Option<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    protocol: u32,
}

/// `ws://{bind}:{port}/ws`
pub fn gateway_ws_url(bind: &str, port: u16) -> String {
    format!("ws://{}:{}/ws", bind.trim(), port)
}

impl Connection {
    /// Open the socket and complete the connect handshake within `timeout`.
    pub async fn connect(
        url: &str,
        token: &AccessToken,
        timeout: Duration,
    ) -> Result<(Connection, Inbound), BridgeError> {
        let (ws, hello) = tokio::time::timeout(timeout, handshake(url, token))
            .await
            .map_err(|_| {
                BridgeError::Connect(format!(
                    "handshake with {} timed out after {}ms",
                    url,
                    timeout.as_millis()
                ))
            })??;

        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);

        tokio::spawn(write_loop(sink, out_rx, closed_rx.clone(), closed_tx.clone()));
        let reader = tokio::spawn(read_loop(stream, frames_tx, closed_tx.clone()));

        log::info!("connected to gateway at {} (protocol {})", url, hello.protocol);
        let conn = Connection {
            outbound: out_tx,
            closed_tx,
            closed_rx,
            reader: Mutex::new(Some(reader)),
            protocol: hello.protocol,
        };
        Ok((conn, frames_rx))
    }

    /// Protocol version agreed in hello-ok.
    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    /// Queue a frame for the writer task.
    pub fn send(&self, frame: &Frame) -> Result<(), BridgeError> {
        if let Some(reason) = self.close_reason() {
            return Err(BridgeError::closed(reason));
        }
        self.outbound
            .send(Message::Text(frame.to_text()))
            .map_err(|_| BridgeError::closed("writer stopped"))
    }

    pub fn is_closed(&self) -> bool {
        self.closed_rx.borrow().is_some()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.closed_rx.borrow().clone()
    }

    /// Resolves once, when the connection drops; yields the reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.closed_rx.clone();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(v) => v.clone(),
            Err(_) => None,
        };
        reason.unwrap_or_else(|| "connection dropped".to_string())
    }

    /// Close the connection. Inbound ends and further sends fail. Idempotent.
    pub fn disconnect(&self) {
        mark_closed(&self.closed_tx, "disconnected");
        let reader = self.reader.lock().ok().and_then(|mut g| g.take());
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// First close reason wins.
fn mark_closed(closed_tx: &watch::Sender<Option<String>>, reason: impl Into<String>) {
    let reason = reason.into();
    closed_tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

/// Socket open → connect.challenge → connect req → hello-ok.
async fn handshake(url: &str, token: &AccessToken) -> Result<(WsStream, HelloOk), BridgeError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| BridgeError::Connect(format!("{}: {}", url, e)))?;

    loop {
        match next_frame(&mut ws).await? {
            Frame::Event(ev) if ev.event == CONNECT_CHALLENGE_EVENT => break,
            other => log::debug!("ignoring frame before connect.challenge: {:?}", other),
        }
    }

    let params = serde_json::to_value(ConnectParams::operator(token.expose()))
        .map_err(|e| BridgeError::Connect(format!("encoding connect params: {}", e)))?;
    let connect_req = Frame::Req(RequestFrame::new(HANDSHAKE_ID, CONNECT_METHOD, params));
    ws.send(Message::Text(connect_req.to_text()))
        .await
        .map_err(|e| BridgeError::Connect(format!("sending connect: {}", e)))?;

    loop {
        match next_frame(&mut ws).await? {
            Frame::Res(res) if res.id == HANDSHAKE_ID => {
                let payload = res.into_result().map_err(|e| match e {
                    BridgeError::Rpc { message, .. } => {
                        BridgeError::Connect(format!("connect rejected: {}", message))
                    }
                    other => other,
                })?;
                let hello: HelloOk = serde_json::from_value(payload)
                    .map_err(|e| BridgeError::Connect(format!("invalid hello-ok: {}", e)))?;
                return Ok((ws, hello));
            }
            other => log::debug!("ignoring frame during handshake: {:?}", other),
        }
    }
}

/// Next well-formed text frame; skips binary/ping frames and malformed text.
async fn next_frame(ws: &mut WsStream) -> Result<Frame, BridgeError> {
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| BridgeError::Connect(e.to_string()))?;
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match Frame::parse(&text) {
            Ok(frame) => return Ok(frame),
            Err(e) => log::debug!("dropping malformed gateway frame: {}", e),
        }
    }
    Err(BridgeError::Connect(
        "gateway closed the connection during handshake".to_string(),
    ))
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut closed: watch::Receiver<Option<String>>,
    closed_tx: Arc<watch::Sender<Option<String>>>,
) {
    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sink.send(msg).await {
                    mark_closed(&closed_tx, format!("write failed: {}", e));
                    break;
                }
            }
            _ = wait_closed(&mut closed) => break,
        }
    }
    let _ = sink.close().await;
}

async fn wait_closed(closed: &mut watch::Receiver<Option<String>>) {
    let _ = closed.wait_for(Option::is_some).await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    frames: mpsc::UnboundedSender<Frame>,
    closed_tx: Arc<watch::Sender<Option<String>>>,
) {
    let mut reason = "gateway closed the connection".to_string();
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match Frame::parse(&text) {
                Ok(frame) => {
                    if frames.send(frame).is_err() {
                        reason = "dispatcher stopped".to_string();
                        break;
                    }
                }
                Err(e) => log::debug!("dropping malformed gateway frame: {}", e),
            },
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    if !frame.reason.is_empty() {
                        reason = format!("gateway closed the connection: {}", frame.reason);
                    }
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                reason = format!("read failed: {}", e);
                break;
            }
        }
    }
    log::debug!("gateway connection reader finished: {}", reason);
    mark_closed(&closed_tx, reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url() {
        assert_eq!(gateway_ws_url(" 127.0.0.1 ", 15151), "ws://127.0.0.1:15151/ws");
    }

    #[test]
    fn first_close_reason_wins() {
        let (tx, rx) = watch::channel(None);
        mark_closed(&tx, "read failed: reset");
        mark_closed(&tx, "disconnected");
        assert_eq!(rx.borrow().as_deref(), Some("read failed: reset"));
    }

    #[tokio::test]
    async fn unreachable_port_is_connect_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = gateway_ws_url("127.0.0.1", port);
        let token = AccessToken::new("t");
        match Connection::connect(&url, &token, Duration::from_secs(2)).await {
            Err(BridgeError::Connect(_)) => {}
            other => panic!("expected connect error, got {:?}", other.map(|_| ())),
        }
    }
}
