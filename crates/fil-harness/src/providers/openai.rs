//! Provider transport for OpenAI-compatible chat completion APIs.
//!
//! Also serves local inference servers (vllm, llama.cpp server, Ollama,
//! text-generation-inference) that expose the same `/v1/chat/completions`
//! protocol; for those the API key is optional.

use serde::Deserialize;

use super::{retry_after_secs, spawn_chunk_stream, SseParse};
use crate::provider::{
    Capability, ChatChunk, ChatProvider, ChatRequest, ChatResponse, ChunkStream, ProviderError,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
    provider_name: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: Some(api_key.into()),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: default_model.into(),
            provider_name: "openai".to_string(),
        }
    }

    /// A local OpenAI-compatible server; auth optional.
    pub fn local(base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: None,
            base_url: base_url.into(),
            default_model: default_model.into(),
            provider_name: "local".to_string(),
        }
    }

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

    /// Build the JSON request body; system messages stay inline.
    pub fn build_request_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": msg.role.to_string(),
                    "content": msg.content,
                })
            })
            .collect();

        serde_json::json!({
            "model": self.model_for(request),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
            "stream": stream,
        })
    }

    fn request(&self, url: &str, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        req
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
struct CompletionResponse {
    choices: Vec<Choice>,
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Parse one `data:` payload of the chat completion stream.
fn parse_stream_data(data: &str) -> Result<SseParse, ProviderError> {
    if data == "[DONE]" {
        return Ok(SseParse::Done);
    }
    let event: StreamResponse =
        serde_json::from_str(data).map_err(|e| ProviderError::Parse(e.to_string()))?;
    let Some(choice) = event.choices.into_iter().next() else {
        return Ok(SseParse::Skip);
    };
    Ok(SseParse::Chunk(ChatChunk {
        delta_content: choice.delta.content.unwrap_or_default(),
        finish_reason: choice.finish_reason,
    }))
}

// ---------------------------------------------------------------------------
// ChatProvider impl
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ChatProvider for OpenAiProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = self.build_request_body(request, false);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let resp = self.request(&url, &body).send().await?;
        let resp = Self::check_status(resp).await?;

        let api_resp: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let choice = api_resp
            .choices
            .first()
            .ok_or_else(|| ProviderError::Parse("no choices in response".into()))?;
        let usage = api_resp.usage.as_ref();

        Ok(ChatResponse {
            content: choice.message.content.clone().unwrap_or_default(),
            model: api_resp.model.unwrap_or_else(|| self.model_for(request)),
            input_tokens: usage.and_then(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: usage.and_then(|u| u.completion_tokens).unwrap_or(0),
            finish_reason: choice
                .finish_reason
                .clone()
                .unwrap_or_else(|| "stop".into()),
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream, ProviderError> {
        let body = self.build_request_body(request, true);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let resp = self.request(&url, &body).send().await?;
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
        let mut req = self.client.get(&url);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let resp = req.send().await?;
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
        &self.provider_name
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;

    #[test]
    fn request_body_keeps_system_inline() {
        let provider = OpenAiProvider::new("k", "gpt-4");
        let request = ChatRequest::new(vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hi"),
        ]);
        let body = provider.build_request_body(&request, false);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(body["model"], "gpt-4");
    }

    #[test]
    fn local_provider_needs_no_key() {
        let provider = OpenAiProvider::local("http://localhost:8000", "llama-3");
        assert!(provider.api_key.is_none());
        assert_eq!(provider.name(), "local");
    }

    #[test]
    fn stream_parse_delta_and_done() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        match parse_stream_data(data).unwrap() {
            SseParse::Chunk(chunk) => assert_eq!(chunk.delta_content, "Hel"),
            _ => panic!("expected chunk"),
        }

        let data = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        match parse_stream_data(data).unwrap() {
            SseParse::Chunk(chunk) => {
                assert!(chunk.delta_content.is_empty());
                assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
            }
            _ => panic!("expected chunk"),
        }

        assert!(matches!(parse_stream_data("[DONE]").unwrap(), SseParse::Done));
    }

    #[test]
    fn stream_parse_garbage_is_an_error() {
        assert!(matches!(
            parse_stream_data("not json").unwrap_err(),
            ProviderError::Parse(_)
        ));
    }

    #[tokio::test]
    async fn connection_refused_surfaces_http_error() {
        let provider = OpenAiProvider::local("http://127.0.0.1:19999", "m");
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);
        let err = provider.complete(&request).await.unwrap_err();
        assert!(matches!(err, ProviderError::Http(_) | ProviderError::Timeout));
    }
}
