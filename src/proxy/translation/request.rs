//! Chat completions → upstream chat-messages request translation
//!
//! | Client                    | Upstream                                  |
//! |---------------------------|-------------------------------------------|
//! | last `messages[]` content | `query`                                   |
//! | `stream`                  | `response_mode` (streaming / blocking)    |
//! | (mapping store)           | `conversation_id`                         |
//! | `messages[..last]`        | `conversation_history` (first turn only)  |
//! | resolved identity         | `user`                                    |

use super::{ChatCompletionRequest, HistoryMessage, ResponseMode, UpstreamRequest};

/// Build the upstream request for one turn
///
/// `conversation_id` is the mapped upstream conversation, if any. When it is
/// present the upstream already holds the context, so history is withheld.
pub fn build_upstream_request(
    request: &ChatCompletionRequest,
    conversation_id: Option<&str>,
    user: &str,
) -> UpstreamRequest {
    let (query, earlier) = match request.messages.split_last() {
        Some((last, earlier)) => (last.text(), earlier),
        None => (String::new(), &[][..]),
    };

    let conversation_history = if conversation_id.is_none() && !earlier.is_empty() {
        Some(
            earlier
                .iter()
                .map(|m| HistoryMessage {
                    role: m.role.clone(),
                    content: m.text(),
                })
                .collect(),
        )
    } else {
        None
    };

    UpstreamRequest {
        inputs: serde_json::Map::new(),
        query,
        response_mode: if request.stream {
            ResponseMode::Streaming
        } else {
            ResponseMode::Blocking
        },
        conversation_id: conversation_id.map(str::to_string),
        user: user.to_string(),
        conversation_history,
    }
}
