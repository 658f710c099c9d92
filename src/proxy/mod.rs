// Proxy module - OpenAI-compatible front for a conversation-oriented upstream
//
// Clients speak the chat completions protocol. Each request is resolved to a
// session (identity), mapped onto an upstream conversation (mapping store),
// translated into a `chat-messages` call, and the answer is translated back,
// either as one JSON completion or as a paced SSE stream (relay).

pub mod api;
pub mod error;
pub mod identity;
pub mod relay;
pub mod server;
pub mod sse;
pub mod state;
pub mod translation;

pub use error::{GatewayError, UpstreamError};
pub use server::start_gateway;
pub use state::{GatewayState, SessionBinding};

use std::convert::Infallible;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::Credential;
use crate::util::short_id;
use relay::StreamRelay;
use translation::request::build_upstream_request;
use translation::response::completion_from_upstream;
use translation::{ChatCompletionRequest, UpstreamCompletion, UpstreamRequest};

/// Frames buffered between the relay and the response body
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let request: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::BadRequest(format!("Invalid request body: {e}")))?;

    let credential = state
        .models
        .get(&request.model)
        .cloned()
        .ok_or_else(|| GatewayError::ModelNotFound {
            model: request.model.clone(),
            available: state.models.names().collect::<Vec<_>>().join(", "),
        })?;

    let identity = state.identity.extract(&headers, &request);
    let binding = state.mappings.resolve(identity.session_key).await;
    let upstream_request =
        build_upstream_request(&request, binding.conversation_id(), &identity.user);

    tracing::info!(
        "Chat completion: model={} stream={} messages={} session={} user={}",
        request.model,
        request.stream,
        request.messages.len(),
        binding.session_key().map(short_id).unwrap_or("-"),
        short_id(&identity.user)
    );

    if request.stream {
        stream_completion(state, credential, upstream_request, binding, request.model).await
    } else {
        blocking_completion(state, credential, upstream_request, binding, request.model).await
    }
}

/// One upstream call, one JSON completion
async fn blocking_completion(
    state: GatewayState,
    credential: Credential,
    upstream_request: UpstreamRequest,
    binding: SessionBinding,
    model: String,
) -> Result<Response, GatewayError> {
    let _permit = state
        .permits
        .acquire()
        .await
        .map_err(|e| GatewayError::Internal(format!("connection limiter closed: {e}")))?;

    let start = Instant::now();
    let response = state
        .client
        .post(state.chat_messages_url.as_ref())
        .bearer_auth(credential.expose())
        .json(&upstream_request)
        .send()
        .await
        .map_err(UpstreamError::from)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(upstream_status(status, &body).into());
    }

    let completion: UpstreamCompletion = response
        .json()
        .await
        .map_err(|e| UpstreamError::Decode(e.to_string()))?;

    tracing::debug!(
        "Upstream answered in {}ms ({} chars)",
        start.elapsed().as_millis(),
        completion.answer.chars().count()
    );

    state
        .mappings
        .commit(&binding, completion.conversation_id.as_deref())
        .await;

    let now = chrono::Utc::now().timestamp();
    Ok(Json(completion_from_upstream(completion, &model, now)).into_response())
}

/// Streamed upstream call relayed as chat completion chunks
///
/// The response starts immediately; upstream failures after this point are
/// reported in-band as an error frame followed by `[DONE]`.
async fn stream_completion(
    state: GatewayState,
    credential: Credential,
    upstream_request: UpstreamRequest,
    binding: SessionBinding,
    model: String,
) -> Result<Response, GatewayError> {
    let permit = state
        .permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| GatewayError::Internal(format!("connection limiter closed: {e}")))?;

    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
    let created = chrono::Utc::now().timestamp();

    tokio::spawn(async move {
        let _permit = permit;
        let start = Instant::now();

        let sent = state
            .client
            .post(state.chat_messages_url.as_ref())
            .bearer_auth(credential.expose())
            .header(header::ACCEPT, "text/event-stream")
            .json(&upstream_request)
            .send()
            .await;

        let response = match sent {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = upstream_status(status, &body);
                tracing::warn!("Upstream rejected stream: {}", error);
                relay::send_failure(&tx, &error).await;
                return;
            }
            Err(e) => {
                let error = UpstreamError::from(e);
                tracing::warn!("Upstream stream request failed: {}", error);
                relay::send_failure(&tx, &error).await;
                return;
            }
        };

        let relay = StreamRelay::new(
            tx,
            state.pacing.clone(),
            state.mappings.clone(),
            binding,
            model,
            created,
        );
        let outcome = relay.run(response.bytes_stream()).await;
        tracing::debug!(
            "Stream finished after {}ms: {:?}",
            start.elapsed().as_millis(),
            outcome
        );
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(response)
}

/// reqwest and axum share the `http` crate, so the status carries over as is
fn upstream_status(status: reqwest::StatusCode, body: &str) -> UpstreamError {
    let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    UpstreamError::status(status, body)
}
