//! Named provider registry.
//!
//! Holds every configured LLM backend keyed by id and dispatches unary and
//! streaming completions by capability. Credentials live in the
//! [`SecretStore`]; the registry keeps only references.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::provider::{
    Capability, ChatProvider, ChatRequest, ChatResponse, ChunkStream, ProviderError,
};
use crate::providers::{AnthropicProvider, OpenAiProvider};
use crate::secrets::{Secret, SecretStore};

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    Openai,
    Local,
}

impl std::str::FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::Openai),
            "local" => Ok(ProviderKind::Local),
            other => Err(ProviderError::NotConfigured(format!(
                "unknown provider kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: Option<String>,
    pub model: String,
    /// Reference into the secret store; the key itself is never held here.
    pub secret_ref: Option<String>,
}

/// Health of one provider, as reported by its probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub detail: Option<String>,
}

pub type HealthReport = BTreeMap<String, ProviderHealth>;

// ---------------------------------------------------------------------------
// ProviderRegistry
// ---------------------------------------------------------------------------

struct Registered {
    config: ProviderConfig,
    provider: Arc<dyn ChatProvider>,
}

pub struct ProviderRegistry {
    providers: DashMap<String, Arc<Registered>>,
    secrets: Arc<SecretStore>,
}

impl ProviderRegistry {
    pub fn new(secrets: Arc<SecretStore>) -> Self {
        Self {
            providers: DashMap::new(),
            secrets,
        }
    }

    /// Register a backend from config, storing `secret` (if any) under
    /// `provider:<id>` and building the transport for the config's kind.
    pub fn register(
        &self,
        mut config: ProviderConfig,
        secret: Option<Secret>,
    ) -> Result<(), ProviderError> {
        if let Some(secret) = secret {
            let reference = format!("provider:{}", config.id);
            self.secrets.put(&reference, secret);
            config.secret_ref = Some(reference);
        }

        let key = config
            .secret_ref
            .as_deref()
            .and_then(|reference| self.secrets.get(reference));

        let provider: Arc<dyn ChatProvider> = match config.kind {
            ProviderKind::Anthropic => {
                let key = key.ok_or_else(|| {
                    ProviderError::NotConfigured(format!("provider {} has no API key", config.id))
                })?;
                let mut p = AnthropicProvider::new(key.expose(), &config.model);
                if let Some(ref endpoint) = config.endpoint {
                    p = p.with_base_url(endpoint);
                }
                Arc::new(p)
            }
            ProviderKind::Openai => {
                let key = key.ok_or_else(|| {
                    ProviderError::NotConfigured(format!("provider {} has no API key", config.id))
                })?;
                let mut p = OpenAiProvider::new(key.expose(), &config.model);
                if let Some(ref endpoint) = config.endpoint {
                    p = p.with_base_url(endpoint);
                }
                Arc::new(p)
            }
            ProviderKind::Local => {
                let endpoint = config
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| "http://localhost:8000".to_string());
                Arc::new(OpenAiProvider::local(endpoint, &config.model))
            }
        };

        tracing::info!(provider_id = %config.id, kind = ?config.kind, model = %config.model, "provider registered");
        self.providers
            .insert(config.id.clone(), Arc::new(Registered { config, provider }));
        Ok(())
    }

    /// Register a pre-built backend (tests, custom transports).
    pub fn register_with(&self, config: ProviderConfig, provider: Arc<dyn ChatProvider>) {
        self.providers
            .insert(config.id.clone(), Arc::new(Registered { config, provider }));
    }

    pub fn get(&self, id: &str) -> Result<ProviderConfig, ProviderError> {
        self.providers
            .get(id)
            .map(|r| r.config.clone())
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<ProviderConfig> {
        let mut configs: Vec<ProviderConfig> =
            self.providers.iter().map(|r| r.config.clone()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    pub fn remove(&self, id: &str) -> Result<(), ProviderError> {
        let (_, registered) = self
            .providers
            .remove(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        if let Some(ref reference) = registered.config.secret_ref {
            self.secrets.remove(reference);
        }
        Ok(())
    }

    fn resolve(
        &self,
        id: &str,
        capability: Capability,
    ) -> Result<Arc<Registered>, ProviderError> {
        let registered = self
            .providers
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        if !registered.provider.capabilities().contains(&capability) {
            return Err(ProviderError::Unsupported(format!(
                "provider {id} does not support {capability:?}"
            )));
        }
        Ok(registered)
    }

    /// Default the request's model from config when the caller left it
    /// empty.
    fn with_model(registered: &Registered, mut request: ChatRequest) -> ChatRequest {
        if request.model.is_none() {
            request.model = Some(registered.config.model.clone());
        }
        request
    }

    pub async fn models(&self, id: &str) -> Result<Vec<String>, ProviderError> {
        let registered = self.resolve(id, Capability::ListModels)?;
        registered.provider.list_models().await
    }

    pub async fn complete(
        &self,
        id: &str,
        request: ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        let registered = self.resolve(id, Capability::ChatComplete)?;
        let request = Self::with_model(&registered, request);
        registered.provider.complete(&request).await
    }

    /// The hot path: forward the request and hand back the chunk stream.
    /// No proxy-side buffering or retries; dropping the stream cancels the
    /// upstream call.
    pub async fn stream(&self, id: &str, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        let registered = self.resolve(id, Capability::StreamChat)?;
        let request = Self::with_model(&registered, request);
        registered.provider.stream(&request).await
    }

    /// Probe one provider, or every registered provider when `id` is
    /// `None`. Probes run with a short timeout and never fail the call.
    pub async fn health(&self, id: Option<&str>) -> HealthReport {
        let targets: Vec<Arc<Registered>> = match id {
            Some(id) => self
                .providers
                .get(id)
                .map(|r| vec![Arc::clone(r.value())])
                .unwrap_or_default(),
            None => self.providers.iter().map(|r| Arc::clone(r.value())).collect(),
        };

        let mut report = HealthReport::new();
        for registered in targets {
            let health = if !registered
                .provider
                .capabilities()
                .contains(&Capability::Health)
            {
                ProviderHealth {
                    healthy: true,
                    detail: Some("no health probe".into()),
                }
            } else {
                match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, registered.provider.health()).await
                {
                    Ok(Ok(())) => ProviderHealth {
                        healthy: true,
                        detail: None,
                    },
                    Ok(Err(e)) => ProviderHealth {
                        healthy: false,
                        detail: Some(e.to_string()),
                    },
                    Err(_) => ProviderHealth {
                        healthy: false,
                        detail: Some("health probe timed out".into()),
                    },
                }
            };
            report.insert(registered.config.id.clone(), health);
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, MockProvider};
    use futures_util::StreamExt;

    fn config(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            name: id.to_string(),
            kind: ProviderKind::Local,
            endpoint: None,
            model: "mock-model".to_string(),
            secret_ref: None,
        }
    }

    fn registry_with_mock(id: &str, mock: MockProvider) -> ProviderRegistry {
        let registry = ProviderRegistry::new(Arc::new(SecretStore::new()));
        registry.register_with(config(id), Arc::new(mock));
        registry
    }

    #[tokio::test]
    async fn complete_dispatches_and_defaults_model() {
        let registry = registry_with_mock("p1", MockProvider::new("mock"));

        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);
        let response = registry.complete("p1", request).await.unwrap();
        assert_eq!(response.content, "mock response");
        assert_eq!(response.model, "mock-model");
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let registry = ProviderRegistry::new(Arc::new(SecretStore::new()));
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);
        let err = registry.complete("nope", request).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn stream_round_trips_chunks() {
        let mock = MockProvider::new("mock").with_response(ChatResponse {
            content: "a b c".into(),
            model: "mock-model".into(),
            input_tokens: 1,
            output_tokens: 3,
            finish_reason: "end_turn".into(),
        });
        let registry = registry_with_mock("p1", mock);

        let mut stream = registry
            .stream("p1", ChatRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap();
        let mut assembled = String::new();
        while let Some(chunk) = stream.next().await {
            assembled.push_str(&chunk.unwrap().delta_content);
        }
        assert_eq!(assembled, "a b c");
    }

    #[tokio::test]
    async fn register_requires_key_for_hosted_kinds() {
        let registry = ProviderRegistry::new(Arc::new(SecretStore::new()));
        let mut cfg = config("hosted");
        cfg.kind = ProviderKind::Anthropic;
        let err = registry.register(cfg, None).unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn register_stores_secret_by_reference() {
        let secrets = Arc::new(SecretStore::new());
        let registry = ProviderRegistry::new(Arc::clone(&secrets));
        let mut cfg = config("hosted");
        cfg.kind = ProviderKind::Openai;
        registry
            .register(cfg, Some(Secret::new("sk-test")))
            .unwrap();

        let stored = registry.get("hosted").unwrap();
        assert_eq!(stored.secret_ref.as_deref(), Some("provider:hosted"));
        assert_eq!(secrets.get("provider:hosted").unwrap().expose(), "sk-test");
    }

    #[tokio::test]
    async fn remove_drops_secret() {
        let secrets = Arc::new(SecretStore::new());
        let registry = ProviderRegistry::new(Arc::clone(&secrets));
        let mut cfg = config("hosted");
        cfg.kind = ProviderKind::Openai;
        registry
            .register(cfg, Some(Secret::new("sk-test")))
            .unwrap();
        registry.remove("hosted").unwrap();
        assert!(secrets.get("provider:hosted").is_none());
        assert!(registry.get("hosted").is_err());
    }

    #[tokio::test]
    async fn health_reports_per_provider() {
        let healthy = MockProvider::new("up");
        let sick = MockProvider::new("down");
        sick.set_healthy(false);

        let registry = ProviderRegistry::new(Arc::new(SecretStore::new()));
        registry.register_with(config("up"), Arc::new(healthy));
        registry.register_with(config("down"), Arc::new(sick));

        let report = registry.health(None).await;
        assert!(report["up"].healthy);
        assert!(!report["down"].healthy);
        assert!(report["down"].detail.is_some());

        let single = registry.health(Some("up")).await;
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn kind_parses_from_str() {
        assert_eq!("anthropic".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert!("martian".parse::<ProviderKind>().is_err());
    }
}
