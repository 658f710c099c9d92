//! Upstream → chat completions response translation
//!
//! Blocking results become one `chat.completion` object. Streams become a
//! sequence of `chat.completion.chunk` frames, one per character, closed by
//! a `finish_reason: "stop"` frame and the `[DONE]` sentinel.

use bytes::Bytes;
use serde::Serialize;

use super::UpstreamCompletion;
use crate::proxy::error::error_body;

/// End-of-stream sentinel frame
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct StreamChunk<'a> {
    id: &'a str,
    object: &'static str,
    created: i64,
    model: &'a str,
    choices: [StreamChoice<'a>; 1],
}

#[derive(Debug, Serialize)]
struct StreamChoice<'a> {
    index: u32,
    delta: Delta<'a>,
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Default, Serialize)]
struct Delta<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
}

// ============================================================================
// Builders
// ============================================================================

/// Client-facing completion for a blocking upstream result
///
/// `model` echoes what the client asked for, not the upstream's own label.
pub fn completion_from_upstream(upstream: UpstreamCompletion, model: &str, now: i64) -> ChatCompletion {
    ChatCompletion {
        id: upstream.message_id,
        object: "chat.completion",
        created: upstream.created.unwrap_or(now),
        model: model.to_string(),
        choices: vec![CompletionChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content: upstream.answer,
            },
            finish_reason: "stop",
        }],
    }
}

/// Per-stream frame factory: fixes id, model and creation time
#[derive(Debug, Clone)]
pub struct ChunkWriter {
    pub id: String,
    pub model: String,
    pub created: i64,
}

impl ChunkWriter {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
        }
    }

    fn frame(&self, delta: Delta<'_>, finish_reason: Option<&'static str>) -> Bytes {
        let chunk = StreamChunk {
            id: &self.id,
            object: "chat.completion.chunk",
            created: self.created,
            model: &self.model,
            choices: [StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        };
        sse_frame(&chunk)
    }

    /// Delta frame carrying `content`
    pub fn content(&self, content: &str) -> Bytes {
        self.frame(
            Delta {
                content: Some(content),
            },
            None,
        )
    }

    /// Terminal frame: empty delta, `finish_reason: "stop"`
    pub fn stop(&self) -> Bytes {
        self.frame(Delta::default(), Some("stop"))
    }
}

/// Inline error frame: `data: {"error": {...}}`
pub fn error_frame(message: &str, kind: &str, code: &str) -> Bytes {
    sse_frame(&error_body(message, kind, code))
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME.as_bytes())
}

fn sse_frame<T: Serialize>(payload: &T) -> Bytes {
    match serde_json::to_string(payload) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        // Only reachable with non-string map keys, which these types never have
        Err(e) => {
            tracing::error!("Failed to serialize stream frame: {}", e);
            Bytes::from_static(b"data: {\"error\":{\"message\":\"serialization failed\",\"type\":\"internal_error\",\"code\":\"internal_error\"}}\n\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn parse_frame(frame: &Bytes) -> Value {
        let text = std::str::from_utf8(frame).unwrap();
        let payload = text
            .strip_prefix("data: ")
            .and_then(|s| s.strip_suffix("\n\n"))
            .unwrap();
        serde_json::from_str(payload).unwrap()
    }

    #[test]
    fn test_completion_echoes_model_and_defaults_created() {
        let upstream: UpstreamCompletion = serde_json::from_value(json!({
            "message_id": "msg-1",
            "conversation_id": "conv-1",
            "answer": "hello"
        }))
        .unwrap();

        let completion = completion_from_upstream(upstream, "client-model", 1_700_000_000);
        let body = serde_json::to_value(&completion).unwrap();

        assert_eq!(body["id"], "msg-1");
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["created"], 1_700_000_000);
        assert_eq!(body["model"], "client-model");
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn test_completion_keeps_upstream_created() {
        let upstream: UpstreamCompletion =
            serde_json::from_value(json!({"message_id": "m", "answer": "", "created_at": 42}))
                .unwrap();
        assert_eq!(completion_from_upstream(upstream, "x", 99).created, 42);
    }

    #[test]
    fn test_content_and_stop_frames() {
        let writer = ChunkWriter::new("msg-1", "m", 10);

        let content = parse_frame(&writer.content("é"));
        assert_eq!(content["object"], "chat.completion.chunk");
        assert_eq!(content["choices"][0]["delta"]["content"], "é");
        assert!(content["choices"][0]["finish_reason"].is_null());

        let stop = parse_frame(&writer.stop());
        assert_eq!(stop["choices"][0]["delta"], json!({}));
        assert_eq!(stop["choices"][0]["finish_reason"], "stop");
        assert_eq!(stop["id"], "msg-1");
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = parse_frame(&error_frame("Request error: boom", "api_error", "request_failed"));
        assert_eq!(frame["error"]["message"], "Request error: boom");
        assert_eq!(done_frame(), Bytes::from_static(b"data: [DONE]\n\n"));
    }
}
