//! Session key and user id extraction from inbound requests
//!
//! Each identity is resolved from an ordered list of sources; the first
//! non-empty value wins.
//!
//! Session key: exact header → header-name marker scan → `metadata.chat_id`
//! / `metadata.session_id`. Nothing found means a stateless turn.
//!
//! User id: body `user` → exact header → header-name marker scan →
//! `metadata.user_id` → configured default.

use axum::http::HeaderMap;
use serde_json::Value;

use super::translation::ChatCompletionRequest;
use crate::config::IdentityConfig;
use crate::util::short_id;

const SESSION_METADATA_FIELDS: &[&str] = &["chat_id", "session_id"];
const USER_METADATA_FIELDS: &[&str] = &["user_id"];

/// Identity resolved for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Client session key; None for a stateless turn
    pub session_key: Option<String>,
    /// End-user id sent upstream (never empty)
    pub user: String,
}

/// Pure function of the request; holds only the configured lookup rules
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    config: IdentityConfig,
}

impl IdentityExtractor {
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    pub fn extract(&self, headers: &HeaderMap, request: &ChatCompletionRequest) -> Identity {
        if let Some(agent) = header_str(headers, "user-agent") {
            tracing::debug!("Identity: user-agent '{}'", agent);
        }

        Identity {
            session_key: self.session_key(headers, request),
            user: self.user(headers, request),
        }
    }

    fn session_key(&self, headers: &HeaderMap, request: &ChatCompletionRequest) -> Option<String> {
        if let Some((name, value)) = exact_header(headers, &self.config.session_headers) {
            tracing::debug!("Session key {} from header '{}'", short_id(&value), name);
            return Some(value);
        }
        if let Some((name, value)) = marked_header(headers, &self.config.session_markers) {
            tracing::debug!("Session key {} from marked header '{}'", short_id(&value), name);
            return Some(value);
        }
        if let Some((field, value)) = metadata_field(request, SESSION_METADATA_FIELDS) {
            tracing::debug!("Session key {} from metadata.{}", short_id(&value), field);
            return Some(value);
        }

        tracing::debug!("No session key found, turn is stateless");
        None
    }

    fn user(&self, headers: &HeaderMap, request: &ChatCompletionRequest) -> String {
        if let Some(user) = request.user.as_deref().and_then(non_empty) {
            tracing::debug!("User {} from request body", short_id(&user));
            return user;
        }
        if let Some((name, value)) = exact_header(headers, &self.config.user_headers) {
            tracing::debug!("User {} from header '{}'", short_id(&value), name);
            return value;
        }
        if let Some((name, value)) = marked_header(headers, &self.config.user_markers) {
            tracing::debug!("User {} from marked header '{}'", short_id(&value), name);
            return value;
        }
        if let Some((field, value)) = metadata_field(request, USER_METADATA_FIELDS) {
            tracing::debug!("User {} from metadata.{}", short_id(&value), field);
            return value;
        }

        tracing::debug!("No user id found, using '{}'", self.config.default_user);
        self.config.default_user.clone()
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// First configured header name present with a usable value
fn exact_header(headers: &HeaderMap, names: &[String]) -> Option<(String, String)> {
    names.iter().find_map(|name| {
        header_str(headers, name)
            .and_then(non_empty)
            .map(|value| (name.clone(), value))
    })
}

/// First header whose name contains one of the markers
///
/// Header names are already lowercase in `HeaderMap`; markers are lowercased
/// when configuration is loaded.
fn marked_header(headers: &HeaderMap, markers: &[String]) -> Option<(String, String)> {
    headers.iter().find_map(|(name, value)| {
        let name = name.as_str();
        if !markers.iter().any(|m| name.contains(m.as_str())) {
            return None;
        }
        value
            .to_str()
            .ok()
            .and_then(non_empty)
            .map(|v| (name.to_string(), v))
    })
}

/// First listed `metadata.<field>` holding a string or number
fn metadata_field(
    request: &ChatCompletionRequest,
    fields: &[&'static str],
) -> Option<(&'static str, String)> {
    let metadata = request.metadata.as_ref()?.as_object()?;
    fields.iter().find_map(|&field| {
        let value = match metadata.get(field)? {
            Value::String(s) => non_empty(s)?,
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some((field, value))
    })
}
