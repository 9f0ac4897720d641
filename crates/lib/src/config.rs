//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.warden/config.json`) and environment.
//! Every field has a default, so a missing file yields a usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway executable, port, timeouts and auth.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Provider API keys handed to the gateway child (name → key settings).
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// How to launch and talk to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Gateway executable. Default: `warden-gateway` next to the current executable, else on PATH.
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Arguments; `{port}` is replaced with the port chosen for this start.
    #[serde(default = "default_gateway_args")]
    pub args: Vec<String>,

    /// Extra environment for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Address the gateway binds and the bridge connects to (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Port for the gateway WebSocket (default 15151). 0 picks a free port on every start.
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// How long to wait for the gateway to start listening on its port.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Upper bound for one WebSocket connect + handshake attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Default per-call timeout when the caller does not pass one.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    /// How long stop waits after the graceful signal before force-killing.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    /// Lines of child stdout/stderr kept for diagnostics.
    #[serde(default = "default_output_lines")]
    pub output_lines: usize,

    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth. The token is generated per run when absent.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// Shared secret for WebSocket connect. Overridden by WARDEN_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

impl std::fmt::Debug for GatewayAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayAuthConfig")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One provider's API key source.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Key value. When absent the key is read from the env var of the same name in this process.
    pub api_key: Option<String>,
    /// Env var the child reads. Default `<NAME>_API_KEY`.
    pub env_var: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("env_var", &self.env_var)
            .finish()
    }
}

fn default_gateway_args() -> Vec<String> {
    vec!["--port".to_string(), PORT_PLACEHOLDER.to_string()]
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_startup_timeout_ms() -> u64 {
    15_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

fn default_grace_ms() -> u64 {
    5_000
}

fn default_output_lines() -> usize {
    2000
}

/// Replaced in `gateway.args` with the port for the current start.
pub const PORT_PLACEHOLDER: &str = "{port}";

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: default_gateway_args(),
            env: BTreeMap::new(),
            bind: default_gateway_bind(),
            port: default_gateway_port(),
            startup_timeout_ms: default_startup_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            grace_ms: default_grace_ms(),
            output_lines: default_output_lines(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Resolved settings the supervisor runs with.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub bind: String,
    /// 0 = pick a free port on every start.
    pub port: u16,
    pub startup_timeout: Duration,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub health_timeout: Duration,
    pub grace: Duration,
    pub output_lines: usize,
}

impl SupervisorOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let executable = config
            .executable
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(default_gateway_executable);
        Self {
            executable,
            args: config.args.clone(),
            env: config.env.clone(),
            bind: config.bind.trim().to_string(),
            port: config.port,
            startup_timeout: Duration::from_millis(config.startup_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            health_timeout: Duration::from_millis(config.health_timeout_ms),
            grace: Duration::from_millis(config.grace_ms),
            output_lines: config.output_lines.max(1),
        }
    }

    /// Options for `executable` with every other setting at its default.
    pub fn for_executable(executable: impl Into<PathBuf>) -> Self {
        let mut options = Self::from_config(&GatewayConfig::default());
        options.executable = executable.into();
        options
    }

    /// Args with `{port}` substituted.
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|a| a.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }
}

/// Resolve the gateway binary: same directory as this executable, or "warden-gateway" from PATH.
pub fn default_gateway_executable() -> PathBuf {
    let name = if cfg!(windows) {
        "warden-gateway.exe"
    } else {
        "warden-gateway"
    };
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join(name)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Resolve the gateway token: env WARDEN_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    std::env::var(crate::token::TOKEN_ENV)
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .gateway
                .auth
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("WARDEN_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".warden").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (WARDEN_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 15151);
        assert_eq!(g.bind, "127.0.0.1");
        assert_eq!(g.call_timeout_ms, 30_000);
        assert_eq!(g.args, vec!["--port", "{port}"]);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "gateway": { "port": 0, "graceMs": 250 } }"#).unwrap();
        assert_eq!(config.gateway.port, 0);
        assert_eq!(config.gateway.grace_ms, 250);
        assert_eq!(config.gateway.startup_timeout_ms, 15_000);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn args_substitute_port() {
        let mut options = SupervisorOptions::for_executable("/bin/gw");
        options.args = vec!["serve".into(), "--listen=127.0.0.1:{port}".into()];
        assert_eq!(
            options.args_for_port(4321),
            vec!["serve".to_string(), "--listen=127.0.0.1:4321".to_string()]
        );
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join(format!("warden-missing-{}.json", uuid::Uuid::new_v4()));
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.gateway.port, 15151);
    }

    #[test]
    fn invalid_file_reports_path() {
        let path = std::env::temp_dir().join(format!("warden-bad-{}.json", uuid::Uuid::new_v4()));
        std::fs::File::create(&path)
            .and_then(|mut f| f.write_all(b"{ not json"))
            .unwrap();
        let err = load_config(Some(path.clone())).unwrap_err();
        assert!(format!("{:#}", err).contains(&path.display().to_string()));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn provider_key_is_redacted_in_debug() {
        let p = ProviderConfig {
            api_key: Some("sk-live".into()),
            env_var: None,
        };
        assert!(!format!("{:?}", p).contains("sk-live"));
    }
}
