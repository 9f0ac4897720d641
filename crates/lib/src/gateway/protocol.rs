//! Gateway WebSocket protocol types (connect handshake, calls, results, events).
//!
//! Every frame is a JSON text message carrying a `type` discriminant:
//! `req` (call), `res` (result for a call id) or `event` (unsolicited push).

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

pub const PROTOCOL_VERSION: u32 = 1;

/// First frame the gateway sends after the socket opens; carries a nonce.
pub const CONNECT_CHALLENGE_EVENT: &str = "connect.challenge";
/// Keepalive pushed by the gateway at the interval announced in hello-ok.
pub const TICK_EVENT: &str = "tick";
/// Pushed by the gateway right before it closes the socket on graceful shutdown.
pub const SHUTDOWN_EVENT: &str = "shutdown";

pub const CONNECT_METHOD: &str = "connect";
/// Probe method used by health checks.
pub const HEALTH_METHOD: &str = "health";

/// A single frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req(RequestFrame),
    Res(ResponseFrame),
    Event(EventFrame),
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> String {
        // Frames hold only strings, bools and JSON values; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Wire call: `{ "type": "req", "id", "method", "params" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Wire result: `{ "type": "res", "id", "ok", "payload" or "error" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

/// Application-level error carried in a result frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ErrorRepr")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

/// Older gateways send `"error": "text"`; newer ones send `{ code, message }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorRepr {
    Shape {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
    Text(String),
}

pub const GENERIC_ERROR_CODE: &str = "ERROR";

impl From<ErrorRepr> for ErrorShape {
    fn from(repr: ErrorRepr) -> Self {
        match repr {
            ErrorRepr::Shape { code, message } => ErrorShape {
                code: code.unwrap_or_else(|| GENERIC_ERROR_CODE.to_string()),
                message,
            },
            ErrorRepr::Text(message) => ErrorShape {
                code: GENERIC_ERROR_CODE.to_string(),
                message,
            },
        }
    }
}

/// Wire push event: `{ "type": "event", "event", "payload" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Payload on success, [`BridgeError::Rpc`] otherwise.
    pub fn into_result(self) -> Result<serde_json::Value, BridgeError> {
        match (self.ok, self.error) {
            (true, None) => Ok(self.payload.unwrap_or(serde_json::Value::Null)),
            (_, Some(e)) => Err(BridgeError::Rpc {
                code: e.code,
                message: e.message,
            }),
            (false, None) => Err(BridgeError::Rpc {
                code: GENERIC_ERROR_CODE.to_string(),
                message: "request failed".to_string(),
            }),
        }
    }
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Client connect params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: Option<u32>,
    pub max_protocol: Option<u32>,
    #[serde(default)]
    pub client: ConnectClient,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub auth: ConnectAuth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectClient {
    pub id: Option<String>,
    pub version: Option<String>,
    pub platform: Option<String>,
    pub mode: Option<String>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    pub token: Option<String>,
}

impl std::fmt::Debug for ConnectAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectAuth")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ConnectParams {
    /// Params the bridge sends as an operator client of the gateway.
    pub fn operator(token: &str) -> Self {
        Self {
            min_protocol: Some(PROTOCOL_VERSION),
            max_protocol: Some(PROTOCOL_VERSION),
            client: ConnectClient {
                id: Some("warden".to_string()),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
                platform: Some(std::env::consts::OS.to_string()),
                mode: Some("operator".to_string()),
            },
            role: "operator".to_string(),
            auth: ConnectAuth {
                token: Some(token.to_string()),
            },
        }
    }
}

/// Gateway hello-ok payload after a successful connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub typ: String,
    pub protocol: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<HelloPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    pub tick_interval_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_result_and_event_by_type() {
        let res = Frame::parse(r#"{"type":"res","id":"c-1","ok":true,"payload":"pong"}"#).unwrap();
        assert_eq!(res, Frame::Res(ResponseFrame::ok("c-1", json!("pong"))));

        let ev = Frame::parse(r#"{"type":"event","event":"notification","payload":{"n":1}}"#)
            .unwrap();
        assert_eq!(
            ev,
            Frame::Event(EventFrame::new("notification", json!({ "n": 1 })))
        );
    }

    #[test]
    fn request_serializes_with_type_tag() {
        let frame = Frame::Req(RequestFrame::new("c-9", "ping", json!({})));
        let value: serde_json::Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(
            value,
            json!({ "type": "req", "id": "c-9", "method": "ping", "params": {} })
        );
    }

    #[test]
    fn error_accepts_string_or_shape() {
        let text = Frame::parse(r#"{"type":"res","id":"1","ok":false,"error":"unknown method: x"}"#)
            .unwrap();
        let Frame::Res(res) = text else { panic!("expected res") };
        assert_eq!(
            res.into_result(),
            Err(BridgeError::Rpc {
                code: GENERIC_ERROR_CODE.into(),
                message: "unknown method: x".into()
            })
        );

        let shaped = Frame::parse(
            r#"{"type":"res","id":"2","ok":false,"error":{"code":"UNAUTHORIZED","message":"no"}}"#,
        )
        .unwrap();
        let Frame::Res(res) = shaped else { panic!("expected res") };
        assert_eq!(
            res.into_result(),
            Err(BridgeError::Rpc {
                code: "UNAUTHORIZED".into(),
                message: "no".into()
            })
        );
    }

    #[test]
    fn ok_without_payload_is_null() {
        let res = ResponseFrame {
            id: "3".into(),
            ok: true,
            payload: None,
            error: None,
        };
        assert_eq!(res.into_result(), Ok(serde_json::Value::Null));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Frame::parse(r#"{"type":"bogus","id":"1"}"#).is_err());
        assert!(Frame::parse("not json").is_err());
    }

    #[test]
    fn connect_auth_debug_hides_token() {
        let params = ConnectParams::operator("s3cret");
        assert!(!format!("{:?}", params).contains("s3cret"));
    }
}
