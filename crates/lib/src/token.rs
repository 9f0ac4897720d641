//! Access token shared between the bridge, the gateway child and the embedded gateway UI.
//!
//! The token is resolved once per run and survives child restarts. It is a secret: `Debug`
//! and `Display` never print it.

use base64::Engine;

use crate::config::{self, Config};

/// Env var through which the token is handed to the gateway child (and may override config).
pub const TOKEN_ENV: &str = "WARDEN_GATEWAY_TOKEN";

const GENERATED_TOKEN_BYTES: usize = 32;

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Random 256-bit token, base64url without padding.
    pub fn generate() -> anyhow::Result<Self> {
        let mut bytes = [0u8; GENERATED_TOKEN_BYTES];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| anyhow::anyhow!("generating gateway token: {}", e))?;
        Ok(Self(
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes),
        ))
    }

    /// Env var, then `gateway.auth.token`, else a freshly generated token.
    pub fn resolve(config: &Config) -> anyhow::Result<Self> {
        match config::resolve_gateway_token(config) {
            Some(t) => Ok(Self(t)),
            None => {
                log::debug!("no gateway token configured, generating one for this run");
                Self::generate()
            }
        }
    }

    /// The secret itself. Callers must not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

impl std::fmt::Display for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_distinct_and_url_safe() {
        let a = AccessToken::generate().unwrap();
        let b = AccessToken::generate().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.expose().len(), 43);
        assert!(a
            .expose()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn formatting_redacts_secret() {
        let t = AccessToken::new("hunter2");
        assert!(!format!("{:?}", t).contains("hunter2"));
        assert!(!t.to_string().contains("hunter2"));
        assert_eq!(t.expose(), "hunter2");
    }

    #[test]
    fn resolve_uses_configured_token() {
        let mut config = Config::default();
        config.gateway.auth.token = Some("  from-config ".to_string());
        // Env override is process-global; only assert when it is not set by the environment.
        if std::env::var(TOKEN_ENV).is_err() {
            assert_eq!(AccessToken::resolve(&config).unwrap().expose(), "from-config");
        }
    }
}
