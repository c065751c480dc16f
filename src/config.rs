//! Configuration surface: everything read once at loop/façade construction.
//! A plain config struct rather than a builder — the façade, not a single
//! `Agent`, owns lifecycle here.

use crate::permission::PermissionAction;
use crate::retry::RetryConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_system_prompt: String,
    pub follow_up_max: usize,
    pub tool_concurrency: usize,
    pub retry: RetryConfig,
    pub checkpoint_model: String,
    pub default_model: String,
    pub default_permission_action: PermissionAction,
    /// Whether `ReasoningChunk`s are forwarded to the event stream. Never affects persistence — reasoning text is never
    /// stored on a `Message`.
    pub emit_reasoning: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_system_prompt: String::new(),
            follow_up_max: 100,
            tool_concurrency: 8,
            retry: RetryConfig::default(),
            checkpoint_model: "checkpoint-summarizer".to_string(),
            default_model: "default-model".to_string(),
            default_permission_action: PermissionAction::Ask,
            emit_reasoning: false,
        }
    }
}
