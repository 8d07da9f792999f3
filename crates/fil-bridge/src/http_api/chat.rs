use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use futures_util::{Stream, StreamExt};

use super::state::ApiState;
use super::types::ChatCompletionRequest;
use crate::api_error::ApiError;

fn provider_for(state: &ApiState, requested: Option<String>) -> Result<String, ApiError> {
    requested
        .or_else(|| state.default_provider.clone())
        .ok_or_else(|| ApiError::bad_request("no provider_id given and no default configured"))
}

/// POST /api/v1/chat/completions -- unary proxy to the named provider.
///
/// The proxy does not retry; the caller owns retry semantics.
pub(crate) async fn completions(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let provider = provider_for(&state, req.provider_id)?;
    let response = state.registry.complete(&provider, req.request).await?;
    Ok(Json(response))
}

/// POST /api/v1/chat/completions/stream -- token-preserving streaming.
///
/// Pre-header failures surface as status codes; once the stream is open,
/// failures arrive as a final `event: error` frame. Client disconnect
/// closes the upstream provider connection.
pub(crate) async fn completions_stream(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let provider = provider_for(&state, req.provider_id)?;
    let chunks = state.registry.stream(&provider, req.request).await?;

    let feed = chunks.map(|item| {
        let event = match item {
            Ok(chunk) => {
                let data = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string());
                Event::default().event("chunk").data(data)
            }
            Err(e) => Event::default()
                .event("error")
                .data(serde_json::json!({ "error": e.to_string() }).to_string()),
        };
        Ok(event)
    });
    let stream = feed.chain(futures_util::stream::once(async {
        Ok(Event::default().event("done").data("{}"))
    }));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(
                state.config.bridge.sse_keepalive_secs.max(1),
            ))
            .text("keepalive"),
    ))
}
