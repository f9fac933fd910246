pub mod anthropic;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

/// One turn of a two-party chat transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    #[serde(default)]
    pub input_tokens: Option<u32>,
    #[serde(default)]
    pub output_tokens: Option<u32>,
}

/// Coarse failure class for a provider call, used to decide whether a retry
/// can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    RateLimit,
    ServerError,
    Timeout,
    AuthError,
    InvalidRequest,
    Unknown,
}

impl ProviderErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => Self::Timeout,
            429 => Self::RateLimit,
            401 | 403 => Self::AuthError,
            400 | 422 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ServerError | Self::Timeout)
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} api error ({status}): {message}")]
    Api {
        provider: &'static str,
        status: u16,
        kind: ProviderErrorKind,
        message: String,
    },
    #[error("{provider} api error (timeout): request timed out after 60s")]
    Timeout { provider: &'static str },
    #[error("{provider} api error (connect): {message}")]
    Connect {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} returned an undecodable body: {message}")]
    Decode {
        provider: &'static str,
        message: String,
    },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Api { kind, .. } => kind.is_retryable(),
            // A timed-out, unreachable or half-written response says nothing
            // about the request itself.
            ProviderError::Timeout { .. }
            | ProviderError::Connect { .. }
            | ProviderError::Decode { .. } => true,
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;
    fn name(&self) -> &'static str;
}

// ============================================================
// Provider Configuration
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    /// Canned offline responder, usable without credentials.
    Stub,
}

/// Configuration for a single provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider id referenced by character bindings (e.g. "openai").
    pub id: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Custom base URL, falling back to the provider's default endpoint.
    #[serde(default)]
    pub api_base: Option<String>,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            id: id.into(),
            kind,
            api_key: None,
            api_base: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_api_base(mut self, url: impl Into<String>) -> Self {
        self.api_base = Some(url.into());
        self
    }
}

/// Create a provider from configuration.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.kind {
        ProviderKind::Anthropic => {
            let key = config
                .api_key
                .as_ref()
                .ok_or_else(|| anyhow!("anthropic requires api_key"))?;
            let api_base = config
                .api_base
                .as_deref()
                .unwrap_or("https://api.anthropic.com");
            Arc::new(AnthropicProvider::new(key.clone(), api_base))
        }
        ProviderKind::OpenAi => {
            let key = config
                .api_key
                .as_ref()
                .ok_or_else(|| anyhow!("openai requires api_key"))?;
            let api_base = config
                .api_base
                .as_deref()
                .unwrap_or("https://api.openai.com/v1");
            Arc::new(OpenAiProvider::new(key.clone(), api_base))
        }
        ProviderKind::Stub => Arc::new(StubProvider::default()),
    };
    Ok(provider)
}

// ============================================================
// Provider Registry
// ============================================================

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("provider not found: {id}"))
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }

    /// Build a registry from a list of configurations.
    pub fn from_configs(configs: &[ProviderConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let provider = create_provider(config)?;
            tracing::info!(id = %config.id, kind = ?config.kind, "registered provider");
            registry.register(&config.id, provider);
        }
        Ok(registry)
    }
}

/// Offline provider that answers every call with a syntactically valid
/// character reply, so the engine can run without any credentials.
#[derive(Default)]
pub struct StubProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let turn = self.calls.fetch_add(1, Ordering::SeqCst);
        let text = serde_json::json!({
            "recipient": "everyone",
            "reaction_on_previous_message": null,
            "conversation_rating": 5,
            "mood": "neutral",
            "mood_emoji": "🙂",
            "thoughts": format!("canned thought #{turn}"),
            "content": format!("[stub:{}] canned line #{turn}", request.model),
            "end_conversation": false
        })
        .to_string();
        Ok(ChatResponse {
            text,
            input_tokens: None,
            output_tokens: None,
        })
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_get_registered_succeeds() {
        let mut registry = ProviderRegistry::new();
        registry.register("stub", Arc::new(StubProvider::default()));

        let provider = registry.get("stub").unwrap();
        assert_eq!(provider.name(), "stub");
    }

    #[test]
    fn registry_get_unknown_fails() {
        let registry = ProviderRegistry::new();
        let err = registry.get("missing").err().unwrap();
        assert!(err.to_string().contains("provider not found: missing"));
    }

    #[test]
    fn create_provider_requires_keys() {
        let err = create_provider(&ProviderConfig::new("a", ProviderKind::Anthropic))
            .err()
            .unwrap();
        assert!(err.to_string().contains("requires api_key"));

        let ok = create_provider(
            &ProviderConfig::new("a", ProviderKind::Anthropic).with_api_key("k"),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn registry_from_configs_registers_all() {
        let configs = vec![
            ProviderConfig::new("openai", ProviderKind::OpenAi).with_api_key("sk-x"),
            ProviderConfig::new("stub", ProviderKind::Stub),
        ];
        let registry = ProviderRegistry::from_configs(&configs).unwrap();
        let mut ids = registry.list();
        ids.sort_unstable();
        assert_eq!(ids, vec!["openai", "stub"]);
    }

    #[test]
    fn error_kind_classification() {
        assert_eq!(
            ProviderErrorKind::from_status(429),
            ProviderErrorKind::RateLimit
        );
        assert_eq!(
            ProviderErrorKind::from_status(503),
            ProviderErrorKind::ServerError
        );
        assert_eq!(
            ProviderErrorKind::from_status(408),
            ProviderErrorKind::Timeout
        );
        assert_eq!(
            ProviderErrorKind::from_status(401),
            ProviderErrorKind::AuthError
        );
        assert_eq!(
            ProviderErrorKind::from_status(400),
            ProviderErrorKind::InvalidRequest
        );

        assert!(ProviderErrorKind::RateLimit.is_retryable());
        assert!(ProviderErrorKind::ServerError.is_retryable());
        assert!(!ProviderErrorKind::AuthError.is_retryable());
        assert!(!ProviderErrorKind::InvalidRequest.is_retryable());
    }

    #[test]
    fn provider_error_retryability() {
        let api = ProviderError::Api {
            provider: "openai",
            status: 429,
            kind: ProviderErrorKind::RateLimit,
            message: "slow down".into(),
        };
        assert!(api.is_retryable());

        let bad_request = ProviderError::Api {
            provider: "openai",
            status: 400,
            kind: ProviderErrorKind::InvalidRequest,
            message: "bad".into(),
        };
        assert!(!bad_request.is_retryable());

        assert!(ProviderError::Timeout { provider: "x" }.is_retryable());
        assert!(ProviderError::Decode {
            provider: "x",
            message: "truncated".into()
        }
        .is_retryable());
    }

    #[tokio::test]
    async fn stub_provider_produces_parseable_reply() {
        let provider = StubProvider::default();
        let resp = provider
            .chat(ChatRequest {
                model: "demo".into(),
                system: None,
                messages: vec![ChatMessage::user("hi")],
                temperature: 0.7,
                max_tokens: 64,
            })
            .await
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&resp.text).unwrap();
        assert_eq!(value["recipient"], "everyone");
        assert!(value["content"].as_str().unwrap().contains("demo"));
    }
}
