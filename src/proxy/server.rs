//! Gateway server setup and initialization

use std::any::Any;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::config::Config;
use crate::storage::MappingStore;

use super::api;
use super::chat_completions;
use super::error::error_body;
use super::identity::IdentityExtractor;
use super::relay::PacingPolicy;
use super::state::{GatewayState, SessionMapper};

/// Build the pooled upstream client from config
pub fn build_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.upstream.connect_timeout())
        .read_timeout(config.upstream.read_timeout())
        .pool_max_idle_per_host(config.upstream.max_idle_connections)
        .build()
        .context("Failed to create HTTP client")
}

/// Assemble shared state from a validated config
///
/// `Config::validate` must have passed; the upstream URL is taken as is.
pub fn build_state(config: &Config, store: Arc<MappingStore>) -> Result<GatewayState> {
    Ok(GatewayState {
        client: build_client(config)?,
        chat_messages_url: config.upstream.chat_messages_url().into(),
        models: Arc::new(config.models.clone()),
        identity: Arc::new(IdentityExtractor::new(config.identity.clone())),
        mappings: SessionMapper::new(store, config.store.mapping_policy),
        pacing: Arc::new(PacingPolicy::from_config(&config.pacing)),
        permits: Arc::new(Semaphore::new(config.upstream.max_connections)),
        started_at: chrono::Utc::now().timestamp(),
    })
}

/// Routes served by the gateway
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(api::list_models))
        .route("/v1/conversation/mappings", get(api::mapping_stats))
        .route(
            "/v1/conversation/mappings/:session_key",
            delete(api::delete_mapping),
        )
        .route("/v1/conversation/cleanup", post(api::cleanup_mappings))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

/// A panicking handler still answers with the structured error shape
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!("Handler panicked: {}", detail);

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(error_body(
            "Internal server error",
            "internal_error",
            "internal_error",
        )),
    )
        .into_response()
}

/// Start the gateway server
pub async fn start_gateway(
    config: Config,
    store: Arc<MappingStore>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let bind_addr = config.bind_addr;
    let state = build_state(&config, store)?;

    tracing::info!(
        "Upstream: {} ({} model(s): {})",
        state.chat_messages_url,
        state.models.len(),
        state.models.names().collect::<Vec<_>>().join(", ")
    );
    tracing::debug!(
        "Upstream limits: {} concurrent, {} idle per host, connect {:?}, read {:?}",
        config.upstream.max_connections,
        config.upstream.max_idle_connections,
        config.upstream.connect_timeout(),
        config.upstream.read_timeout()
    );

    let app = router(state);

    tracing::info!("Starting gateway on {}", bind_addr);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credential, ModelRegistry};
    use crate::storage::StoreOptions;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(dir: &TempDir) -> GatewayState {
        state_for_upstream(dir, "http://127.0.0.1:9/v1")
    }

    fn state_for_upstream(dir: &TempDir, base_url: &str) -> GatewayState {
        let mut config = Config::default();
        config.upstream.base_url = Some(base_url.to_string());
        config.models = ModelRegistry::new([("alpha".to_string(), Credential::new("sk-a"))]);
        let store = MappingStore::open(StoreOptions {
            db_path: dir.path().join("server.db"),
            ..StoreOptions::default()
        })
        .unwrap();
        build_state(&config, Arc::new(store)).unwrap()
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_models_lists_configured_names() {
        let dir = TempDir::new().unwrap();
        let app = router(test_state(&dir));
        let (status, body) = call(
            app,
            Request::get("/v1/models").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "alpha");
        assert_eq!(body["data"][0]["object"], "model");
    }

    #[tokio::test]
    async fn test_unknown_model_is_404() {
        let dir = TempDir::new().unwrap();
        let app = router(test_state(&dir));
        let request = Request::post("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"model":"nope","messages":[]}"#))
            .unwrap();
        let (status, body) = call(app, request).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "model_not_found");
        assert!(body["error"]["message"].as_str().unwrap().contains("alpha"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let dir = TempDir::new().unwrap();
        let app = router(test_state(&dir));
        let request = Request::post("/v1/chat/completions")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = call(app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    fn chat_request(body: &str) -> Request<Body> {
        Request::post("/v1/chat/completions")
            .header("content-type", "application/json")
            .header("x-chat-id", "chat-9")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_blocking_completion_with_unreachable_upstream() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let request = chat_request(r#"{"model":"alpha","messages":[{"role":"user","content":"hi"}]}"#);
        let (status, body) = call(router(state.clone()), request).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["type"], "connection_error");
        assert_eq!(body["error"]["code"], "connection_failed");
        assert_eq!(state.mappings.store().lookup("chat-9").unwrap(), None);
    }

    #[tokio::test]
    async fn test_stream_with_unreachable_upstream_ends_in_band() {
        let dir = TempDir::new().unwrap();
        let request = chat_request(
            r#"{"model":"alpha","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
        );
        let response = router(test_state(&dir)).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["content-type"], "text/event-stream");
        assert_eq!(headers["cache-control"], "no-cache, no-transform");
        assert_eq!(headers["x-accel-buffering"], "no");

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let first = text
            .split("\n\n")
            .next()
            .and_then(|frame| frame.strip_prefix("data: "))
            .unwrap();
        let frame: Value = serde_json::from_str(first).unwrap();
        assert_eq!(frame["error"]["code"], "connection_failed");
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_blocking_completion_maps_conversation() {
        use axum::http::HeaderMap;

        async fn upstream(headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
            assert_eq!(headers["authorization"], "Bearer sk-a");
            assert_eq!(body["response_mode"], "blocking");
            assert_eq!(body["query"], "hi");
            Json(serde_json::json!({
                "message_id": "msg-9",
                "conversation_id": "conv-9",
                "answer": "hello there",
                "created_at": 1700000000
            }))
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mock = Router::new().route("/v1/chat-messages", post(upstream));
        tokio::spawn(async move { axum::serve(listener, mock).await });

        let dir = TempDir::new().unwrap();
        let state = state_for_upstream(&dir, &format!("http://{addr}/v1"));
        let request = chat_request(r#"{"model":"alpha","messages":[{"role":"user","content":"hi"}]}"#);
        let (status, body) = call(router(state.clone()), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["id"], "msg-9");
        assert_eq!(body["model"], "alpha");
        assert_eq!(body["created"], 1700000000);
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        assert_eq!(body["choices"][0]["message"]["content"], "hello there");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(
            state.mappings.store().lookup("chat-9").unwrap().as_deref(),
            Some("conv-9")
        );
    }

    #[tokio::test]
    async fn test_mapping_endpoints() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state
            .mappings
            .store()
            .create_if_absent("chat-1", "conv-1")
            .unwrap();

        let (status, body) = call(
            router(state.clone()),
            Request::get("/v1/conversation/mappings?recent=5")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["recent"][0]["session_key"], "chat-1");

        let (status, body) = call(
            router(state.clone()),
            Request::delete("/v1/conversation/mappings/chat-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);

        let (_, body) = call(
            router(state),
            Request::delete("/v1/conversation/mappings/chat-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(body["deleted"], false);
    }

    #[tokio::test]
    async fn test_cleanup_defaults_to_thirty_days() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state
            .mappings
            .store()
            .create_if_absent("fresh", "conv-1")
            .unwrap();

        let (status, body) = call(
            router(state),
            Request::post("/v1/conversation/cleanup")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["max_age_days"], 30);
        assert_eq!(body["removed"], 0);
    }
}
