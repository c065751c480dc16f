//! Streaming Provider Contract: the boundary between the Agent Loop
//! and a model backend. Wire protocols are out of scope — this crate
//! only depends on this trait and the chunk stream it produces.

use crate::error::ProviderError;
use crate::types::{FinishReason, Usage};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A tool schema offered to the model for this turn (name + description +
/// JSON-schema parameters, no executable attached — execution is the Tool
/// Runner's concern, not the provider's).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A provider-agnostic turn request built by the Checkpoint Service +
/// Agent Loop from the branch's message history.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<crate::types::Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Opaque passthrough from the agent definition —
    /// the core never interprets this, only forwards it when set.
    pub reasoning_effort: Option<String>,
    /// Whether the caller wants `ReasoningChunk`s emitted on the event
    /// stream as part of `StreamChunk`. Persistence of
    /// reasoning text is never enabled by this flag — only event emission.
    pub emit_reasoning: bool,
    /// Free-form, provider-specific knobs the core passes through unread.
    pub provider_options: Option<serde_json::Value>,
}

/// One unit of a streamed model response. The Agent Loop folds these
/// into the assistant `Message` under construction as they arrive.
#[derive(Debug, Clone)]
pub enum Chunk {
    TextDelta { delta: String },
    ToolCallStart { id: String, name: String },
    ToolCallArgumentsDelta { id: String, delta: String },
    ToolCallEnd { id: String, arguments: serde_json::Value },
    ReasoningDelta { delta: String },
    Finish { reason: FinishReason, usage: Usage },
}

/// The core provider trait. A concrete wire implementation (Anthropic,
/// OpenAI, Bedrock, ...) lives outside this crate — only [`MockProvider`]
/// ships here, to exercise the Agent Loop in tests.
///
/// [`MockProvider`]: crate::provider::MockProvider
#[async_trait]
pub trait Provider: Send + Sync {
    /// Begin streaming a completion. Establishing the stream (the returned
    /// `BoxStream` yielding its first item) is the unit the Retry Policy
    /// retries — once a chunk has been yielded, the sequence is not
    /// restartable.
    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<BoxStream<'static, Result<Chunk, ProviderError>>, ProviderError>;
}
