//! LLM provider abstraction.
//!
//! Defines the [`ChatProvider`] trait for unary and streaming chat
//! completions, the wire-agnostic request/response types, and a
//! [`MockProvider`] for tests. Concrete transports live in
//! [`crate::providers`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures_util::Stream;
use serde::{Deserialize, Serialize};

use fil_core::types::MessageRole;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur when talking to an LLM backend.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider not found: {0}")]
    NotFound(String),

    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("request timed out")]
    Timeout,

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A single message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Provider-shaped completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Empty means "use the provider's configured default model".
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.7
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            model: None,
            messages,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Final assembled response of a unary completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

/// One increment of a streaming completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    pub delta_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Streamed chunks; an `Err` item, if any, is the final one.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, ProviderError>> + Send>>;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// What a backend can do. The registry dispatches by capability, not by
/// concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    ChatComplete,
    StreamChat,
    ListModels,
    Health,
}

// ---------------------------------------------------------------------------
// ChatProvider trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send a completion request and return the assembled response.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream a completion chunk-at-a-time.
    ///
    /// Dropping the returned stream cancels the upstream call promptly.
    /// Providers without [`Capability::StreamChat`] return
    /// [`ProviderError::Unsupported`].
    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream, ProviderError>;

    /// Models this backend serves.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Err(ProviderError::Unsupported(
            "model listing is not available for this provider".into(),
        ))
    }

    /// Cheap reachability probe.
    async fn health(&self) -> Result<(), ProviderError>;

    fn capabilities(&self) -> &'static [Capability];

    /// Human-readable provider name (e.g. "anthropic").
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// A mock backend for tests.
///
/// Each `complete` call pops the next queued response; an empty queue
/// yields a default. `stream` splits the next queued response into
/// word-sized chunks.
pub struct MockProvider {
    provider_name: String,
    responses: Arc<Mutex<VecDeque<Result<ChatResponse, ProviderError>>>>,
    captured: Arc<Mutex<Vec<ChatRequest>>>,
    healthy: Arc<Mutex<bool>>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            provider_name: name.into(),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            captured: Arc::new(Mutex::new(Vec::new())),
            healthy: Arc::new(Mutex::new(true)),
        }
    }

    pub fn with_response(self, response: ChatResponse) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(response));
        self
    }

    pub fn with_error(self, error: ProviderError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock().unwrap() = healthy;
    }

    /// Requests captured for test assertions.
    pub fn captured_requests(&self) -> Vec<ChatRequest> {
        self.captured.lock().unwrap().clone()
    }

    fn default_response(model: &str) -> ChatResponse {
        ChatResponse {
            content: "mock response".to_string(),
            model: model.to_string(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: "end_turn".to_string(),
        }
    }

    fn next_response(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.captured.lock().unwrap().push(request.clone());
        let mut queue = self.responses.lock().unwrap();
        match queue.pop_front() {
            Some(result) => result,
            None => Ok(Self::default_response(
                request.model.as_deref().unwrap_or("mock-model"),
            )),
        }
    }
}

#[async_trait::async_trait]
impl ChatProvider for MockProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.next_response(request)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.next_response(request)?;
        let mut chunks: Vec<Result<ChatChunk, ProviderError>> = response
            .content
            .split_inclusive(' ')
            .map(|word| {
                Ok(ChatChunk {
                    delta_content: word.to_string(),
                    finish_reason: None,
                })
            })
            .collect();
        chunks.push(Ok(ChatChunk {
            delta_content: String::new(),
            finish_reason: Some(response.finish_reason),
        }));
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["mock-model".to_string()])
    }

    async fn health(&self) -> Result<(), ProviderError> {
        if *self.healthy.lock().unwrap() {
            Ok(())
        } else {
            Err(ProviderError::Http("mock provider marked unhealthy".into()))
        }
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::ChatComplete,
            Capability::StreamChat,
            Capability::ListModels,
            Capability::Health,
        ]
    }

    fn name(&self) -> &str {
        &self.provider_name
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn mock_returns_default_then_queued() {
        let provider = MockProvider::new("mock").with_response(ChatResponse {
            content: "queued".into(),
            model: "m".into(),
            input_tokens: 1,
            output_tokens: 1,
            finish_reason: "stop".into(),
        });
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);

        let first = provider.complete(&request).await.unwrap();
        assert_eq!(first.content, "queued");
        let second = provider.complete(&request).await.unwrap();
        assert_eq!(second.content, "mock response");
    }

    #[tokio::test]
    async fn mock_stream_reassembles_to_content() {
        let provider = MockProvider::new("mock").with_response(ChatResponse {
            content: "three word answer".into(),
            model: "m".into(),
            input_tokens: 1,
            output_tokens: 3,
            finish_reason: "end_turn".into(),
        });
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);

        let mut stream = provider.stream(&request).await.unwrap();
        let mut assembled = String::new();
        let mut finish = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            assembled.push_str(&chunk.delta_content);
            if chunk.finish_reason.is_some() {
                finish = chunk.finish_reason;
            }
        }
        assert_eq!(assembled, "three word answer");
        assert_eq!(finish.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn mock_captures_requests() {
        let provider = MockProvider::new("mock");
        let request = ChatRequest::new(vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hello"),
        ]);
        provider.complete(&request).await.unwrap();

        let captured = provider.captured_requests();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].messages.len(), 2);
        assert_eq!(captured[0].messages[0].role, MessageRole::System);
    }

    #[tokio::test]
    async fn mock_health_toggles() {
        let provider = MockProvider::new("mock");
        assert!(provider.health().await.is_ok());
        provider.set_healthy(false);
        assert!(provider.health().await.is_err());
    }

    #[test]
    fn request_defaults() {
        let json = r#"{"messages":[{"role":"user","content":"hi"}]}"#;
        let request: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.max_tokens, 1024);
        assert!(request.model.is_none());
    }
}
