//! `MockProvider` (SPEC_FULL supplement #3): the crate's one concrete
//! `Provider` implementation, used by the Agent Loop's own test suite and
//! by downstream crates that want to exercise the loop without a live model.

use super::traits::{Chunk, Provider, ProviderRequest};
use crate::error::ProviderError;
use crate::types::{FinishReason, Usage};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Mutex;

/// A single canned turn the mock will play back.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Emit a text delta then finish with `Stop`.
    Text(String),
    /// Emit one or more tool calls then finish with `ToolCalls`.
    ToolCalls(Vec<MockToolCall>),
    /// Return this error instead of establishing a stream.
    Error(ProviderError),
    /// Yield nothing and wait until the cancellation token fires, then
    /// return a `StreamInterrupted` error — for exercising cancel/interrupt
    /// mid-turn (spec Scenario C).
    HangUntilCancelled,
    /// Emit one text delta, then wait until the cancellation token fires
    /// before returning a `StreamInterrupted` error — for exercising the
    /// partial-text persistence path of cancel/interject (spec Scenarios
    /// C and D, where some text accumulated before the hard stop).
    TextThenHang(String),
}

#[derive(Debug, Clone)]
pub struct MockToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Queued-response test double for [`Provider`]. Responses are consumed in
/// order; once exhausted, every further call returns a fixed fallback text
/// response rather than panicking, so tests that under-provision responses
/// fail on an assertion instead of a panic deep in the loop.
pub struct MockProvider {
    responses: Mutex<Vec<MockResponse>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![MockResponse::Text(text.into())])
    }

    pub fn texts(texts: Vec<impl Into<String>>) -> Self {
        Self::new(texts.into_iter().map(|t| MockResponse::Text(t.into())).collect())
    }

    fn next_response(&self) -> MockResponse {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            MockResponse::Text("(no more mock responses)".into())
        } else {
            responses.remove(0)
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn stream(
        &self,
        _request: ProviderRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<BoxStream<'static, Result<Chunk, ProviderError>>, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::StreamInterrupted("cancelled before start".into()));
        }

        let response = self.next_response();
        match response {
            MockResponse::Error(err) => Err(err),
            MockResponse::Text(text) => {
                let chunks = vec![
                    Ok(Chunk::TextDelta { delta: text }),
                    Ok(Chunk::Finish {
                        reason: FinishReason::Stop,
                        usage: Usage::default(),
                    }),
                ];
                Ok(Box::pin(futures::stream::iter(chunks)))
            }
            MockResponse::ToolCalls(calls) => {
                let mut chunks = Vec::new();
                for (i, call) in calls.into_iter().enumerate() {
                    let id = format!("mock-tool-{i}");
                    chunks.push(Ok(Chunk::ToolCallStart {
                        id: id.clone(),
                        name: call.name,
                    }));
                    chunks.push(Ok(Chunk::ToolCallEnd {
                        id,
                        arguments: call.arguments,
                    }));
                }
                chunks.push(Ok(Chunk::Finish {
                    reason: FinishReason::ToolCalls,
                    usage: Usage::default(),
                }));
                Ok(Box::pin(futures::stream::iter(chunks)))
            }
            // The hang has to live inside the stream's polling, not in this
            // establishing future: the Agent Loop only cancels its turn
            // token from the select loop that reads chunks *after* `stream`
            // returns, so blocking here on `cancel.cancelled()` would
            // deadlock the turn instead of exercising its interrupt path.
            MockResponse::HangUntilCancelled => {
                let stream = async_stream::stream! {
                    cancel.cancelled().await;
                    yield Err(ProviderError::StreamInterrupted("cancelled mid-stream".into()));
                };
                Ok(Box::pin(stream))
            }
            MockResponse::TextThenHang(text) => {
                let stream = async_stream::stream! {
                    yield Ok(Chunk::TextDelta { delta: text });
                    cancel.cancelled().await;
                    yield Err(ProviderError::StreamInterrupted("cancelled mid-stream".into()));
                };
                Ok(Box::pin(stream))
            }
        }
    }
}
