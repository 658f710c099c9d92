// SSE (Server-Sent Events) parsing module
//
// This module handles parsing of the upstream chat-messages event stream.
// It provides two levels of parsing:
//
// 1. **Line reassembly**: upstream byte chunks do not align with lines. The
//    `LineBuffer` keeps the residue between reads and hands out complete
//    lines. Bytes are reassembled before UTF-8 decoding, so a multi-byte
//    character split across two chunks decodes intact.
//
// 2. **Event parsing**: each `data:` line is one JSON event. Lines without
//    the data marker (comments, `event:` lines, keep-alives) are skipped.
//
// # Upstream event shapes
//
// ```
// data: {"event": "message", "answer": "Hel", "message_id": "...", "conversation_id": "..."}
// data: {"event": "message_end", "message_id": "...", "conversation_id": "..."}
// data: {"event": "ping"}
// ```

use serde::Deserialize;

// ============================================================================
// Line reassembly
// ============================================================================

/// Residual byte buffer that yields complete `\n` / `\r\n` terminated lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw chunk from the upstream
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line without its terminator, if one is buffered
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(decode(line))
    }

    /// Whatever is left once the upstream has closed, if non-blank
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            self.buf.clear();
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(decode(rest))
    }

    /// Bytes held back waiting for a terminator
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn decode(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

// ============================================================================
// Event parsing
// ============================================================================

/// One parsed upstream stream event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A fragment of the answer
    Message {
        answer: String,
        message_id: Option<String>,
        conversation_id: Option<String>,
    },
    /// The answer is complete
    MessageEnd { message_id: Option<String> },
    /// The upstream aborted the answer
    Error {
        message: String,
        code: Option<String>,
    },
    /// Anything else (ping, workflow progress, ...)
    Other { kind: String },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
    /// String or number depending on upstream version
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// Parse one line of the upstream stream
///
/// Returns `Ok(None)` for lines that carry no event (no `data:` marker,
/// blank payload, `[DONE]`). A `data:` line whose payload is not an event
/// object is an error; callers log and skip it.
pub fn parse_line(line: &str) -> Result<Option<StreamEvent>, serde_json::Error> {
    let Some(payload) = line.trim_start().strip_prefix("data:") else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(None);
    }

    let raw: RawEvent = serde_json::from_str(payload)?;
    let kind = raw.event.unwrap_or_default();

    let event = match kind.as_str() {
        // Agent-mode apps stream the same shape under a different name
        "message" | "agent_message" => match raw.answer {
            Some(answer) => StreamEvent::Message {
                answer,
                message_id: raw.message_id.filter(|s| !s.is_empty()),
                conversation_id: raw.conversation_id.filter(|s| !s.is_empty()),
            },
            None => StreamEvent::Other { kind },
        },
        "message_end" => StreamEvent::MessageEnd {
            message_id: raw.message_id.filter(|s| !s.is_empty()),
        },
        "error" => StreamEvent::Error {
            message: raw
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "upstream reported an error".to_string()),
            code: raw.code.and_then(|c| match c {
                serde_json::Value::String(s) if !s.is_empty() => Some(s),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            }),
        },
        _ => StreamEvent::Other { kind },
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut lines = LineBuffer::new();
        lines.push(b"data: {\"a\"");
        assert_eq!(lines.next_line(), None);

        lines.push(b": 1}\r\ndata: x\n\npartial");
        assert_eq!(lines.next_line().as_deref(), Some("data: {\"a\": 1}"));
        assert_eq!(lines.next_line().as_deref(), Some("data: x"));
        assert_eq!(lines.next_line().as_deref(), Some(""));
        assert_eq!(lines.next_line(), None);
        assert_eq!(lines.pending(), "partial".len());
        assert_eq!(lines.finish().as_deref(), Some("partial"));
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let bytes = "data: é\n".as_bytes();
        // 'é' is two bytes; split in the middle of it
        let split = "data: ".len() + 1;

        let mut lines = LineBuffer::new();
        lines.push(&bytes[..split]);
        assert_eq!(lines.next_line(), None);
        lines.push(&bytes[split..]);
        assert_eq!(lines.next_line().as_deref(), Some("data: é"));
    }

    #[test]
    fn test_parse_message_event() {
        let event = parse_line(
            r#"data: {"event": "message", "answer": "Hi", "message_id": "m1", "conversation_id": "c1"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            Some(StreamEvent::Message {
                answer: "Hi".into(),
                message_id: Some("m1".into()),
                conversation_id: Some("c1".into()),
            })
        );
    }

    #[test]
    fn test_parse_message_end_and_other() {
        assert_eq!(
            parse_line(r#"data: {"event": "message_end", "message_id": "m1"}"#).unwrap(),
            Some(StreamEvent::MessageEnd {
                message_id: Some("m1".into())
            })
        );
        assert_eq!(
            parse_line(r#"data:{"event":"ping"}"#).unwrap(),
            Some(StreamEvent::Other {
                kind: "ping".into()
            })
        );
    }

    #[test]
    fn test_parse_error_event() {
        assert_eq!(
            parse_line(
                r#"data: {"event": "error", "status": 400, "code": "invalid_param", "message": "quota exceeded"}"#
            )
            .unwrap(),
            Some(StreamEvent::Error {
                message: "quota exceeded".into(),
                code: Some("invalid_param".into()),
            })
        );
        assert_eq!(
            parse_line(r#"data: {"event": "error", "code": 500}"#).unwrap(),
            Some(StreamEvent::Error {
                message: "upstream reported an error".into(),
                code: Some("500".into()),
            })
        );
    }

    #[test]
    fn test_non_data_lines_are_skipped() {
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("event: message").unwrap(), None);
        assert_eq!(parse_line(": keep-alive").unwrap(), None);
        assert_eq!(parse_line("data: [DONE]").unwrap(), None);
    }

    #[test]
    fn test_malformed_data_line_is_an_error() {
        assert!(parse_line("data: {not json").is_err());
        assert!(parse_line("data: [1, 2]").is_err());
    }
}
