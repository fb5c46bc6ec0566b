//! Model key -> provider capability lookup.

use anyhow::{Context, Result};
use genrelay_config::{Config, ProviderConfig, ProviderKind, secret_from_env};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::info;

use crate::gemini::{self, GeminiImageProvider};
use crate::kie::{self, KieProvider};
use crate::kling::{self, KlingEndpoint, KlingProvider};
use crate::provider::GenerationProvider;
use crate::runway::{self, RunwayProvider};

const HTTP_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn GenerationProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.providers.keys().collect();
        keys.sort();
        f.debug_struct("ProviderRegistry")
            .field("models", &keys)
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model_key: impl Into<String>, provider: Arc<dyn GenerationProvider>) {
        self.providers.insert(model_key.into(), provider);
    }

    pub fn with(mut self, model_key: impl Into<String>, provider: Arc<dyn GenerationProvider>) -> Self {
        self.register(model_key, provider);
        self
    }

    pub fn get(&self, model_key: &str) -> Option<Arc<dyn GenerationProvider>> {
        self.providers.get(model_key).cloned()
    }

    /// The provider for `model_key`, only if it can poll remote tasks.
    pub fn poller(&self, model_key: &str) -> Option<Arc<dyn GenerationProvider>> {
        self.get(model_key).filter(|p| p.supports_polling())
    }

    pub fn contains(&self, model_key: &str) -> bool {
        self.providers.contains_key(model_key)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Build adapters for every `[providers.<model>]` entry.
    ///
    /// Fails if an API key variable is unset. Gemini providers share one
    /// download semaphore sized by the largest configured limit.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        let download_limit = config
            .providers
            .values()
            .filter(|p| p.kind == ProviderKind::GeminiImage)
            .filter_map(|p| p.download_concurrency)
            .max()
            .unwrap_or(gemini::DEFAULT_DOWNLOAD_CONCURRENCY);
        let downloads = Arc::new(Semaphore::new(download_limit));

        let mut registry = Self::new();
        for (model_key, provider) in &config.providers {
            let api_key = secret_from_env(&provider.api_key_env)
                .with_context(|| format!("API key for provider '{model_key}'"))?;
            let secret_key = provider
                .secret_key_env
                .as_deref()
                .map(secret_from_env)
                .transpose()
                .with_context(|| format!("secret key for provider '{model_key}'"))?;
            let credentials = Credentials { api_key, secret_key };
            let adapter = build_adapter(model_key, provider, credentials, client.clone(), &downloads)?;
            info!(model = %model_key, kind = %provider.kind, "provider registered");
            registry.register(model_key.clone(), adapter);
        }
        Ok(registry)
    }
}

struct Credentials {
    api_key: String,
    secret_key: Option<String>,
}

fn build_adapter(
    model_key: &str,
    provider: &ProviderConfig,
    credentials: Credentials,
    client: reqwest::Client,
    downloads: &Arc<Semaphore>,
) -> Result<Arc<dyn GenerationProvider>> {
    let Credentials { api_key, secret_key } = credentials;
    let adapter: Arc<dyn GenerationProvider> = match provider.kind {
        ProviderKind::GeminiImage => {
            let model = provider
                .model
                .clone()
                .unwrap_or_else(|| model_key.to_string());
            let adapter = GeminiImageProvider::new(model_key, model, api_key, client)
                .with_base_url(provider.base_url.as_deref().unwrap_or(gemini::DEFAULT_BASE_URL))
                .with_download_limit(downloads.clone());
            Arc::new(adapter)
        }
        ProviderKind::Runway => {
            let adapter = RunwayProvider::new(model_key, api_key, client)
                .with_base_url(provider.base_url.as_deref().unwrap_or(runway::DEFAULT_BASE_URL))
                .with_task_timing(
                    provider.poll_interval_seconds.unwrap_or(runway::DEFAULT_POLL_AFTER_S),
                    provider.task_timeout_seconds.unwrap_or(runway::DEFAULT_TASK_TIMEOUT_S),
                );
            Arc::new(adapter)
        }
        ProviderKind::Kie => {
            let adapter = KieProvider::new(model_key, api_key, client)
                .with_base_url(provider.base_url.as_deref().unwrap_or(kie::DEFAULT_BASE_URL))
                .with_task_timing(
                    provider.poll_interval_seconds.unwrap_or(kie::DEFAULT_POLL_AFTER_S),
                    provider.task_timeout_seconds.unwrap_or(kie::DEFAULT_TASK_TIMEOUT_S),
                );
            Arc::new(adapter)
        }
        ProviderKind::KlingText2Video
        | ProviderKind::KlingImage2Video
        | ProviderKind::KlingMotionControl => {
            let endpoint = match provider.kind {
                ProviderKind::KlingText2Video => KlingEndpoint::TextToVideo,
                ProviderKind::KlingImage2Video => KlingEndpoint::ImageToVideo,
                _ => KlingEndpoint::MotionControl,
            };
            let secret_key = secret_key.with_context(|| {
                format!("provider '{model_key}' of kind '{}' needs secret_key_env", provider.kind)
            })?;
            let adapter = KlingProvider::new(model_key, endpoint, api_key, secret_key, client)
                .with_model(provider.model.as_deref().unwrap_or(kling::DEFAULT_MODEL))
                .with_base_url(provider.base_url.as_deref().unwrap_or(kling::DEFAULT_BASE_URL))
                .with_task_timing(
                    provider.poll_interval_seconds.unwrap_or(kling::DEFAULT_POLL_AFTER_S),
                    provider.task_timeout_seconds.unwrap_or(kling::DEFAULT_TASK_TIMEOUT_S),
                );
            Arc::new(adapter)
        }
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_config(kind: ProviderKind) -> ProviderConfig {
        ProviderConfig {
            kind,
            model: None,
            base_url: None,
            api_key_env: "UNUSED".into(),
            secret_key_env: None,
            poll_interval_seconds: None,
            task_timeout_seconds: None,
            download_concurrency: None,
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            api_key: "key".into(),
            secret_key: Some("secret".into()),
        }
    }

    fn adapter(kind: ProviderKind) -> Arc<dyn GenerationProvider> {
        build_adapter(
            "model",
            &provider_config(kind),
            credentials(),
            reqwest::Client::new(),
            &Arc::new(Semaphore::new(1)),
        )
        .unwrap()
    }

    #[test]
    fn test_poller_only_for_polling_providers() {
        let registry = ProviderRegistry::new()
            .with("gemini_3_image", adapter(ProviderKind::GeminiImage))
            .with("runway", adapter(ProviderKind::Runway))
            .with("kie", adapter(ProviderKind::Kie))
            .with("kling_i2v", adapter(ProviderKind::KlingImage2Video));
        assert_eq!(registry.len(), 4);
        assert!(registry.poller("kling_i2v").is_some());
        assert!(registry.get("gemini_3_image").is_some());
        assert!(registry.poller("gemini_3_image").is_none());
        assert!(registry.poller("runway").is_some());
        assert!(registry.poller("kie").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_kling_without_secret_key_fails() {
        let result = build_adapter(
            "kling_t2v",
            &provider_config(ProviderKind::KlingText2Video),
            Credentials {
                api_key: "key".into(),
                secret_key: None,
            },
            reqwest::Client::new(),
            &Arc::new(Semaphore::new(1)),
        );
        let err = result.err().unwrap();
        assert!(format!("{err:#}").contains("secret_key_env"));
    }

    #[test]
    fn test_adapter_named_after_model_key() {
        assert_eq!(adapter(ProviderKind::Runway).name(), "model");
    }

    #[test]
    fn test_from_config_without_providers() {
        let registry = ProviderRegistry::from_config(&Config::default()).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_from_config_missing_secret_fails() {
        let config = Config::from_toml_str(
            r#"
            [policies.runway]
            concurrency = 1

            [providers.runway]
            kind = "runway"
            api_key_env = "GENRELAY_TEST_SURELY_UNSET_KEY"
            "#,
        )
        .unwrap();
        let err = ProviderRegistry::from_config(&config).unwrap_err();
        assert!(format!("{err:#}").contains("GENRELAY_TEST_SURELY_UNSET_KEY"));
    }

    #[tokio::test]
    async fn test_default_poll_is_unsupported() {
        let gemini = adapter(ProviderKind::GeminiImage);
        let err = gemini.poll("T1").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<genrelay_core::AppError>(),
            Some(genrelay_core::AppError::PollingUnsupported(_))
        ));
    }
}
