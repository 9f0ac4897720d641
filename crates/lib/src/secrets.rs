//! Provider API keys handed to the gateway child through its environment.
//!
//! Secure storage itself lives outside this crate; it plugs in through [`SecretStore`].

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::config::ProviderConfig;

/// One provider key and the env var the gateway expects it under.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderKey {
    pub provider: String,
    pub env_var: String,
    pub value: String,
}

impl std::fmt::Debug for ProviderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderKey")
            .field("provider", &self.provider)
            .field("env_var", &self.env_var)
            .finish_non_exhaustive()
    }
}

/// Source of provider API keys (OS keychain, settings vault, ...).
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn provider_keys(&self) -> anyhow::Result<Vec<ProviderKey>>;
}

/// Store with no keys; the gateway starts without provider credentials.
pub struct NoSecrets;

#[async_trait]
impl SecretStore for NoSecrets {
    async fn provider_keys(&self) -> anyhow::Result<Vec<ProviderKey>> {
        Ok(Vec::new())
    }
}

/// Keys from the `providers` config section, falling back to this process's env.
pub struct ConfigSecretStore {
    providers: BTreeMap<String, ProviderConfig>,
}

impl ConfigSecretStore {
    pub fn new(providers: BTreeMap<String, ProviderConfig>) -> Self {
        Self { providers }
    }
}

/// `openai` → `OPENAI_API_KEY`, `google-genai` → `GOOGLE_GENAI_API_KEY`.
pub fn default_env_var(provider: &str) -> String {
    let name: String = provider
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_API_KEY", name)
}

#[async_trait]
impl SecretStore for ConfigSecretStore {
    async fn provider_keys(&self) -> anyhow::Result<Vec<ProviderKey>> {
        let mut keys = Vec::new();
        for (provider, cfg) in &self.providers {
            let env_var = cfg
                .env_var
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| default_env_var(provider));
            let value = cfg
                .api_key
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    std::env::var(&env_var)
                        .ok()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                });
            match value {
                Some(value) => keys.push(ProviderKey {
                    provider: provider.clone(),
                    env_var,
                    value,
                }),
                None => log::debug!("no api key for provider {}, skipping", provider),
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_names() {
        assert_eq!(default_env_var("openai"), "OPENAI_API_KEY");
        assert_eq!(default_env_var("google-genai"), "GOOGLE_GENAI_API_KEY");
    }

    #[tokio::test]
    async fn config_keys_with_override_and_skip() {
        let mut providers = BTreeMap::new();
        providers.insert(
            "anthropic".to_string(),
            ProviderConfig {
                api_key: Some("sk-ant".into()),
                env_var: None,
            },
        );
        providers.insert(
            "custom".to_string(),
            ProviderConfig {
                api_key: Some("k".into()),
                env_var: Some("CUSTOM_TOKEN".into()),
            },
        );
        providers.insert(
            format!("unset-{}", uuid::Uuid::new_v4().simple()),
            ProviderConfig::default(),
        );
        let keys = ConfigSecretStore::new(providers).provider_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].env_var, "ANTHROPIC_API_KEY");
        assert_eq!(keys[0].value, "sk-ant");
        assert_eq!(keys[1].env_var, "CUSTOM_TOKEN");
        assert!(!format!("{:?}", keys[0]).contains("sk-ant"));
    }
}
