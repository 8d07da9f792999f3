//! Provider transport for the Anthropic Messages API.

use serde::Deserialize;

use fil_core::types::MessageRole;

use super::{retry_after_secs, spawn_chunk_stream, SseParse};
use crate::provider::{
    Capability, ChatChunk, ChatProvider, ChatRequest, ChatResponse, ChunkStream, ProviderError,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: default_model.into(),
        }
    }

    /// Override the base URL (useful for testing with a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn model_for(&self, request: &ChatRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    /// Build the JSON request body.
    ///
    /// Anthropic takes the system prompt in a top-level `system` field, so
    /// system messages are extracted out of the messages array and joined.
    pub fn build_request_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut system_text: Option<String> = None;
        let api_messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter_map(|msg| {
                if msg.role == MessageRole::System {
                    match system_text {
                        Some(ref mut s) => {
                            s.push('\n');
                            s.push_str(&msg.content);
                        }
                        None => system_text = Some(msg.content.clone()),
                    }
                    None
                } else {
                    Some(serde_json::json!({
                        "role": msg.role.to_string(),
                        "content": msg.content,
                    }))
                }
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model_for(request),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": api_messages,
            "stream": stream,
        });
        if let Some(system) = system_text {
            body["system"] = serde_json::Value::String(system);
        }
        body
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = resp.status().as_u16();
        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after_secs(resp.headers()),
            });
        }
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message });
        }
        Ok(resp)
    }
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    _type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
    message: String,
}

/// Parse one `data:` payload of the Anthropic event stream.
fn parse_stream_data(data: &str) -> Result<SseParse, ProviderError> {
    let event: StreamEvent =
        serde_json::from_str(data).map_err(|e| ProviderError::Parse(e.to_string()))?;
    match event.event_type.as_str() {
        "content_block_delta" => {
            let text = event.delta.and_then(|d| d.text).unwrap_or_default();
            Ok(SseParse::Chunk(ChatChunk {
                delta_content: text,
                finish_reason: None,
            }))
        }
        "message_delta" => {
            let stop = event.delta.and_then(|d| d.stop_reason);
            match stop {
                Some(reason) => Ok(SseParse::Chunk(ChatChunk {
                    delta_content: String::new(),
                    finish_reason: Some(reason),
                })),
                None => Ok(SseParse::Skip),
            }
        }
        "message_stop" => Ok(SseParse::Done),
        "error" => Err(ProviderError::Stream(
            event.error.map(|e| e.message).unwrap_or_default(),
        )),
        // message_start, content_block_start/stop, ping
        _ => Ok(SseParse::Skip),
    }
}

// ---------------------------------------------------------------------------
// ChatProvider impl
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ChatProvider for AnthropicProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = self.build_request_body(request, false);
        let url = format!("{}/v1/messages", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;

        let api_resp: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatResponse {
            content,
            model: api_resp.model,
            input_tokens: api_resp.usage.input_tokens,
            output_tokens: api_resp.usage.output_tokens,
            finish_reason: api_resp.stop_reason.unwrap_or_else(|| "unknown".into()),
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream, ProviderError> {
        let body = self.build_request_body(request, true);
        let url = format!("{}/v1/messages", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;

        Ok(spawn_chunk_stream(resp, parse_stream_data))
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        #[derive(Deserialize)]
        struct ModelsResponse {
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        let url = format!("{}/v1/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        let models: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    async fn health(&self) -> Result<(), ProviderError> {
        self.list_models().await.map(|_| ())
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
        "anthropic"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
