//! Per-module error types, composed into a crate-level [`CoreError`]
//! for operations invoked outside the scope of a turn.

use crate::types::{BranchId, MessageId, SessionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("branch {0} not found")]
    BranchNotFound(BranchId),
    #[error("message {0} not found")]
    MessageNotFound(MessageId),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider stream was interrupted before completion: {0}")]
    StreamInterrupted(String),
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<String> },
    #[error("provider returned a non-retryable error: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Whether the Retry Policy should ever consider retrying this.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::RateLimited { .. })
    }
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("event store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum AgentLoopError {
    #[error("no agent loop is registered for session {0} branch {1}")]
    NotRunning(SessionId, BranchId),
    #[error("an agent loop is already running for session {0} branch {1}")]
    AlreadyRunning(SessionId, BranchId),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
    #[error("execution limit exceeded: {0}")]
    LimitExceeded(String),
}

#[derive(Debug, Error)]
pub enum SubagentError {
    #[error("unknown agent definition: {0}")]
    UnknownAgent(String),
    #[error("sub-agent recursion depth exceeded ({0})")]
    DepthExceeded(usize),
    #[error(transparent)]
    AgentLoop(#[from] AgentLoopError),
}

#[derive(Debug, Error)]
#[error("permission denied for tool {tool_name}: {reason}")]
pub struct PermissionDenied {
    pub tool_name: String,
    pub reason: String,
}

#[derive(Debug, Error)]
#[error("invalid input for tool {tool_name}: {reason}")]
pub struct InvalidToolInput {
    pub tool_name: String,
    pub reason: String,
}

/// Aggregate error for façade operations that can fail outside the scope of
/// a turn.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
    #[error(transparent)]
    AgentLoop(#[from] AgentLoopError),
    #[error(transparent)]
    Subagent(#[from] SubagentError),
    #[error(transparent)]
    PermissionDenied(#[from] PermissionDenied),
    #[error(transparent)]
    InvalidToolInput(#[from] InvalidToolInput),
}
