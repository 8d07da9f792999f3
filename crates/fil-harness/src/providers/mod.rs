//! Concrete provider transports.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use std::time::Duration;

use futures_util::StreamExt;

use crate::provider::{ChatChunk, ChunkStream, ProviderError};

/// Hard ceiling on a single streaming session.
pub(crate) const STREAM_CEILING: Duration = Duration::from_secs(300);

/// What one `data:` payload means for the chunk stream.
#[derive(Debug)]
pub(crate) enum SseParse {
    Chunk(ChatChunk),
    Done,
    Skip,
}

/// Decode a provider's SSE body into a [`ChunkStream`].
///
/// One task per stream: it reads the HTTP body line-by-line, feeds parsed
/// chunks through a small bounded channel, and exits when the body ends,
/// the parser reports `Done`, the ceiling elapses, or the consumer drops
/// the stream (which also drops the upstream connection).
pub(crate) fn spawn_chunk_stream(
    response: reqwest::Response,
    parse: impl Fn(&str) -> Result<SseParse, ProviderError> + Send + Sync + 'static,
) -> ChunkStream {
    let (tx, rx) = flume::bounded::<Result<ChatChunk, ProviderError>>(32);

    tokio::spawn(async move {
        let deadline = tokio::time::timeout(STREAM_CEILING, async {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(part) = body.next().await {
                let bytes = match part {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send_async(Err(ProviderError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    match parse(data.trim_start()) {
                        Ok(SseParse::Chunk(chunk)) => {
                            if tx.send_async(Ok(chunk)).await.is_err() {
                                // Consumer gone; close upstream.
                                return;
                            }
                        }
                        Ok(SseParse::Done) => return,
                        Ok(SseParse::Skip) => {}
                        Err(e) => {
                            // Error sentinel is the final delivery.
                            let _ = tx.send_async(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        })
        .await;

        if deadline.is_err() {
            let _ = tx.send_async(Err(ProviderError::Timeout)).await;
        }
    });

    Box::pin(rx.into_stream())
}

/// Numeric `Retry-After` header, when present.
pub(crate) fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}
