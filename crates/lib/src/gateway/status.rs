//! Aggregate gateway status as seen by consumers (tray, settings, setup wizard).

use serde::Serialize;

/// Lifecycle state of the supervised gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    Stopped,
    Starting,
    Running,
    Error,
}

/// Snapshot of the supervisor's status.
///
/// Fields are private so `port` can only be present while running and `error` only in the
/// error state; use the constructors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    state: GatewayState,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl GatewayStatus {
    pub fn stopped() -> Self {
        Self {
            state: GatewayState::Stopped,
            port: None,
            error: None,
        }
    }

    pub fn starting() -> Self {
        Self {
            state: GatewayState::Starting,
            port: None,
            error: None,
        }
    }

    pub fn running(port: u16) -> Self {
        Self {
            state: GatewayState::Running,
            port: Some(port),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: GatewayState::Error,
            port: None,
            error: Some(message.into()),
        }
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.state == GatewayState::Running
    }

    /// Starting or running: a second `start()` is a no-op.
    pub fn is_active(&self) -> bool {
        matches!(self.state, GatewayState::Starting | GatewayState::Running)
    }
}

impl Default for GatewayStatus {
    fn default() -> Self {
        Self::stopped()
    }
}

impl std::fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.state, self.port, self.error.as_deref()) {
            (GatewayState::Running, Some(port), _) => write!(f, "running on port {}", port),
            (GatewayState::Error, _, Some(e)) => write!(f, "error: {}", e),
            (GatewayState::Starting, _, _) => f.write_str("starting"),
            _ => f.write_str("stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_only_when_running() {
        assert_eq!(GatewayStatus::running(15151).port(), Some(15151));
        assert_eq!(GatewayStatus::starting().port(), None);
        assert_eq!(GatewayStatus::stopped().port(), None);
        assert_eq!(GatewayStatus::error("boom").port(), None);
    }

    #[test]
    fn error_only_in_error_state() {
        assert_eq!(GatewayStatus::error("boom").error_message(), Some("boom"));
        assert_eq!(GatewayStatus::running(1).error_message(), None);
        assert_eq!(GatewayStatus::stopped().error_message(), None);
    }

    #[test]
    fn serializes_without_absent_fields() {
        let json = serde_json::to_value(GatewayStatus::running(4000)).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "running", "port": 4000 }));
        let json = serde_json::to_value(GatewayStatus::stopped()).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "stopped" }));
    }
}
