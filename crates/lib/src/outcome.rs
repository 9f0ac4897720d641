//! Uniform `{ success, data, error }` result shape for UI-facing callers.

use serde::Serialize;

use crate::error::BridgeError;

/// What consumers branch on instead of error types.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Outcome<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

impl<T> From<Result<T, BridgeError>> for Outcome<T> {
    fn from(result: Result<T, BridgeError>) -> Self {
        match result {
            Ok(data) => Outcome::ok(data),
            Err(e) => Outcome::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failure_shape() {
        let outcome: Outcome<serde_json::Value> =
            Err(BridgeError::HealthCheckFailed("not connected".into())).into();
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({ "success": false, "error": "gateway health check failed: not connected" })
        );
    }

    #[test]
    fn success_shape() {
        let outcome: Outcome<serde_json::Value> = Ok(json!("pong")).into();
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({ "success": true, "data": "pong" })
        );
    }
}
