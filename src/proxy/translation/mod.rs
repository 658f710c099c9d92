//! API translation - chat completions ↔ upstream chat-messages
//!
//! # Architecture
//!
//! ```text
//! Client Request (chat completions)
//!     ↓
//! request::build_upstream_request  ← resolved upstream conversation id
//!     ↓
//! POST {upstream}/chat-messages
//!     ↓
//! blocking:  response::completion_from_upstream
//! streaming: relay (sse + response::content_chunk / stop_chunk)
//!     ↓
//! Client Response (chat completion / chunk stream)
//! ```
//!
//! The upstream keeps conversation context server-side once it has assigned
//! a conversation id, so history is only forwarded on the first turn.

pub mod request;
pub mod response;

use serde::{Deserialize, Serialize};

// ============================================================================
// Client-facing wire types
// ============================================================================

/// Inbound chat completions request
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    /// Explicit end-user id
    #[serde(default)]
    pub user: Option<String>,
    /// Free-form metadata; may carry session and user hints
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// One message of the conversation
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// Message content: a plain string or an array of typed parts
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<serde_json::Value>),
}

impl MessageContent {
    /// Text projection: text parts joined with newlines, other parts dropped
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl ChatMessage {
    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::to_text)
            .unwrap_or_default()
    }
}

// ============================================================================
// Upstream wire types
// ============================================================================

/// Upstream response mode, mirrors the client's `stream` flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Streaming,
    Blocking,
}

/// History entry forwarded on the first turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Body of `POST {upstream}/chat-messages`
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub query: String,
    pub response_mode: ResponseMode,
    pub conversation_id: Option<String>,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_history: Option<Vec<HistoryMessage>>,
}

/// Completed blocking-mode upstream result
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamCompletion {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub answer: String,
    #[serde(default, alias = "created_at")]
    pub created: Option<i64>,
}
