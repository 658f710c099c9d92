//! Upstream service settings and the model → credential registry

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::ConfigError;
use crate::util::fingerprint;

// ─────────────────────────────────────────────────────────────────────────────
// Upstream Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Upstream chat-workflow service settings
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL; `/chat-messages` is appended. Required to serve.
    pub base_url: Option<String>,
    /// TCP connect timeout
    pub connect_timeout_secs: u64,
    /// Per-read timeout while waiting on upstream bytes
    pub read_timeout_secs: u64,
    /// Concurrent upstream calls per process
    pub max_connections: usize,
    /// Idle keep-alive connections per host
    pub max_idle_connections: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            max_connections: 100,
            max_idle_connections: 20,
        }
    }
}

/// Upstream settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileUpstream {
    pub base_url: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub max_connections: Option<usize>,
    pub max_idle_connections: Option<usize>,
}

impl UpstreamConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileUpstream>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            base_url: file.base_url.or(defaults.base_url),
            connect_timeout_secs: file
                .connect_timeout_secs
                .unwrap_or(defaults.connect_timeout_secs),
            read_timeout_secs: file.read_timeout_secs.unwrap_or(defaults.read_timeout_secs),
            max_connections: file.max_connections.unwrap_or(defaults.max_connections),
            max_idle_connections: file
                .max_idle_connections
                .unwrap_or(defaults.max_idle_connections),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Base URL without trailing slashes; empty when unset
    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or("").trim_end_matches('/')
    }

    /// Full URL of the chat endpoint
    pub fn chat_messages_url(&self) -> String {
        format!("{}/chat-messages", self.base_url())
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        // Zero permits would park every chat request forever
        let max = tokio::sync::Semaphore::MAX_PERMITS;
        if self.max_connections == 0 || self.max_connections > max {
            return Err(ConfigError::InvalidPoolLimit {
                value: self.max_connections,
                max,
            });
        }

        let raw = match self.base_url.as_deref().map(str::trim) {
            None | Some("") => return Err(ConfigError::MissingUpstreamUrl),
            Some(raw) => raw,
        };

        match reqwest::Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(()),
            _ => Err(ConfigError::InvalidUpstreamUrl(raw.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────────────────

/// Upstream bearer credential
///
/// Debug output shows only a fingerprint so the secret never reaches a log.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    #[cfg(test)]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret, for the Authorization header only
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Short SHA-256 fingerprint, safe to log
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(sha256:{})", self.fingerprint())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Model Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only model name → credential map, fixed at startup
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Credential>,
}

impl ModelRegistry {
    #[cfg(test)]
    pub fn new(models: impl IntoIterator<Item = (String, Credential)>) -> Self {
        Self {
            models: models.into_iter().collect(),
        }
    }

    /// Parse the `MODEL_CONFIG` environment value: a JSON object only
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(ConfigError::ModelConfigJson)?;
        let serde_json::Value::Object(map) = value else {
            return Err(ConfigError::ModelConfigNotObject);
        };

        let mut models = BTreeMap::new();
        for (name, value) in map {
            match value {
                serde_json::Value::String(secret) => {
                    models.insert(name, Credential(secret));
                }
                _ => return Err(ConfigError::NonStringCredential(name)),
            }
        }
        Ok(Self { models })
    }

    /// Build from the `[models]` table of the config file
    pub fn from_toml(table: BTreeMap<String, toml::Value>) -> Result<Self, ConfigError> {
        let mut models = BTreeMap::new();
        for (name, value) in table {
            match value {
                toml::Value::String(secret) => {
                    models.insert(name, Credential(secret));
                }
                _ => return Err(ConfigError::NonStringCredential(name)),
            }
        }
        Ok(Self { models })
    }

    pub fn get(&self, model: &str) -> Option<&Credential> {
        self.models.get(model)
    }

    /// Model names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Credential)> {
        self.models.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }
        if let Some((name, _)) = self
            .models
            .iter()
            .find(|(_, c)| c.expose().trim().is_empty())
        {
            return Err(ConfigError::EmptyCredential(name.clone()));
        }
        Ok(())
    }
}
