//! Gateway error types and response handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::util::truncate_utf8_safe;

/// Upstream bodies quoted in error messages are capped at this many bytes
const MAX_QUOTED_BODY: usize = 512;

/// Failures talking to the upstream chat service
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Connection timeout: {0}")]
    ConnectTimeout(String),

    #[error("Failed to connect to upstream API: {0}")]
    Connect(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Upstream API error ({status}): {body}")]
    Status { status: StatusCode, body: String },

    #[error("Invalid upstream response: {0}")]
    Decode(String),

    /// Error event sent by the upstream in the middle of a stream
    #[error("Upstream error: {message}")]
    Event { message: String, code: Option<String> },
}

impl UpstreamError {
    /// Classify a reqwest failure the way the HTTP boundary reports it
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        let message = e.to_string();
        if e.is_connect() && e.is_timeout() {
            Self::ConnectTimeout(message)
        } else if e.is_connect() {
            Self::Connect(message)
        } else if e.is_timeout() {
            Self::Timeout(message)
        } else if e.is_decode() {
            Self::Decode(message)
        } else {
            Self::Request(message)
        }
    }

    /// Non-2xx upstream response; the body is quoted, truncated
    pub fn status(status: StatusCode, body: &str) -> Self {
        Self::Status {
            status,
            body: truncate_utf8_safe(body.trim(), MAX_QUOTED_BODY).to_string(),
        }
    }

    /// (HTTP status, error type, error code) reported to the client
    pub fn classify(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            Self::ConnectTimeout(_) => (StatusCode::REQUEST_TIMEOUT, "timeout_error", "connect_timeout"),
            Self::Connect(_) => (StatusCode::SERVICE_UNAVAILABLE, "connection_error", "connection_failed"),
            Self::Timeout(_) => (StatusCode::REQUEST_TIMEOUT, "timeout_error", "request_timeout"),
            Self::Request(_) => (StatusCode::SERVICE_UNAVAILABLE, "api_error", "request_failed"),
            Self::Status { status, .. } => (*status, "api_error", "upstream_error"),
            Self::Decode(_) => (StatusCode::BAD_GATEWAY, "api_error", "invalid_upstream_response"),
            Self::Event { .. } => (StatusCode::BAD_GATEWAY, "api_error", "upstream_error"),
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        Self::from_reqwest(e)
    }
}

/// Errors returned by gateway handlers, rendered as structured JSON bodies
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Model {model} is not supported. Available models: {available}")]
    ModelNotFound { model: String, available: String },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", "invalid_request"),
            Self::ModelNotFound { .. } => (StatusCode::NOT_FOUND, "invalid_request_error", "model_not_found"),
            Self::Upstream(e) => e.classify(),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal_error"),
        }
    }
}

/// `{"error": {"message", "type", "code"}}`
pub fn error_body(message: &str, kind: &str, code: &str) -> serde_json::Value {
    json!({
        "error": {
            "message": message,
            "type": kind,
            "code": code,
        }
    })
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, kind, code) = self.parts();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!("Gateway error: {} - {}", status, message);
        } else {
            tracing::warn!("Gateway error: {} - {}", status, message);
        }

        (status, Json(error_body(&message, kind, code))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_status_codes() {
        let cases = [
            (UpstreamError::ConnectTimeout("x".into()), StatusCode::REQUEST_TIMEOUT),
            (UpstreamError::Connect("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (UpstreamError::Timeout("x".into()), StatusCode::REQUEST_TIMEOUT),
            (UpstreamError::Request("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                UpstreamError::status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(GatewayError::from(error).parts().0, expected);
        }
    }

    #[test]
    fn test_model_not_found_is_404() {
        let response = GatewayError::ModelNotFound {
            model: "nope".into(),
            available: "a, b".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_status_body_is_truncated() {
        let long = "x".repeat(4_096);
        let UpstreamError::Status { body, .. } = UpstreamError::status(StatusCode::BAD_GATEWAY, &long)
        else {
            panic!("expected Status");
        };
        assert_eq!(body.len(), MAX_QUOTED_BODY);
    }

    #[test]
    fn test_error_body_shape() {
        let body = error_body("boom", "api_error", "request_failed");
        assert_eq!(body["error"]["message"], "boom");
        assert_eq!(body["error"]["type"], "api_error");
        assert_eq!(body["error"]["code"], "request_failed");
    }
}
