//! Core data model: sessions, branches, messages, and the little value types
//! that thread through the rest of the crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A session identifier. Opaque outside the crate; construct with `SessionId::new()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId(pub uuid::Uuid);

impl BranchId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for BranchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Time-sortable message id (UUIDv7: timestamp prefix + random tail), so
/// `MessageId` ordering matches creation order even in stores that only
/// index by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally monotonic event id — the only cross-store ordering primitive
/// in the system.
pub type EventId = u64;

// ---------------------------------------------------------------------------
// Roles & message parts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// Only meaningful on `Role::User` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    #[default]
    Regular,
    Interjection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Part {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "toolCall")]
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    #[serde(rename = "toolResult")]
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        output: ToolOutput,
    },
}

/// The shape a Tool Runner result always takes: either a JSON value
/// on success, or a tagged error — never an unhandled exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolOutput {
    #[serde(rename = "json")]
    Json { value: serde_json::Value },
    #[serde(rename = "error-json")]
    ErrorJson { value: ToolErrorValue },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolErrorValue {
    pub error: String,
}

impl ToolOutput {
    pub fn error(message: impl Into<String>) -> Self {
        Self::ErrorJson {
            value: ToolErrorValue {
                error: message.into(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::ErrorJson { .. })
    }

    /// First line of the serialised value, truncated to 100 chars — the
    /// `summary` field on `ToolCallCompleted`.
    pub fn summary(&self) -> String {
        let text = match self {
            Self::Json { value } => value.to_string(),
            Self::ErrorJson { value } => value.error.clone(),
        };
        let first_line = text.lines().next().unwrap_or("");
        first_line.chars().take(100).collect()
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub branch_id: BranchId,
    pub role: Role,
    #[serde(default)]
    pub kind: MessageKind,
    pub parts: Vec<Part>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Set on the user message that initiated a turn, once the turn ends.
    pub turn_duration_ms: Option<u64>,
}

impl Message {
    pub fn new_user(
        session_id: SessionId,
        branch_id: BranchId,
        text: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            branch_id,
            role: Role::User,
            kind,
            parts: vec![Part::Text { text: text.into() }],
            created_at: chrono::Utc::now(),
            turn_duration_ms: None,
        }
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some((id.as_str(), name.as_str(), arguments)),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error,
    Aborted,
}
