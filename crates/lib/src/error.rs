//! Error taxonomy for the gateway bridge.

use std::time::Duration;

/// Every failure the supervisor, transport or correlator can report.
///
/// Call-site failures ([`BridgeError::Rpc`], [`BridgeError::Timeout`]) are local to one call.
/// Process and transport failures also move the supervisor into its error state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to spawn gateway {executable}: {reason}")]
    Spawn { executable: String, reason: String },

    #[error("gateway not reachable: {0}")]
    Connect(String),

    #[error("gateway connection closed: {0}")]
    TransportClosed(String),

    #[error("call {method} timed out after {}ms", .after.as_millis())]
    Timeout { method: String, after: Duration },

    #[error("gateway returned {code}: {message}")]
    Rpc { code: String, message: String },

    #[error("gateway health check failed: {0}")]
    HealthCheckFailed(String),
}

impl BridgeError {
    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        BridgeError::TransportClosed(reason.into())
    }

    /// True for failures that only affect one call and leave the supervisor state alone.
    pub fn is_call_local(&self) -> bool {
        matches!(self, BridgeError::Rpc { .. } | BridgeError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_reports_millis() {
        let e = BridgeError::Timeout {
            method: "slow".into(),
            after: Duration::from_millis(50),
        };
        assert_eq!(e.to_string(), "call slow timed out after 50ms");
        assert!(e.is_call_local());
    }

    #[test]
    fn transport_failures_are_not_call_local() {
        assert!(!BridgeError::closed("peer went away").is_call_local());
        assert!(!BridgeError::Connect("refused".into()).is_call_local());
    }
}
