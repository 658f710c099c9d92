//! Request handling settings: identity hints and stream pacing

use serde::{Deserialize, Serialize};

use super::ConfigError;

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Where session keys and user ids are looked for on inbound requests
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// User id when no source supplies one
    pub default_user: String,
    /// Exact header names carrying the session key (case-insensitive)
    pub session_headers: Vec<String>,
    /// Substrings that mark a header as carrying the session key
    pub session_markers: Vec<String>,
    /// Exact header names carrying the user id (case-insensitive)
    pub user_headers: Vec<String>,
    /// Substrings that mark a header as carrying the user id
    pub user_markers: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            default_user: "default_user".to_string(),
            session_headers: strings(&["x-openwebui-chat-id", "x-chat-id", "x-session-id"]),
            session_markers: strings(&["chat-id", "chat_id"]),
            user_headers: strings(&["x-openwebui-user-id", "x-user-id"]),
            user_markers: strings(&["user-id", "user_id"]),
        }
    }
}

/// Identity settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileIdentity {
    pub default_user: Option<String>,
    pub session_headers: Option<Vec<String>>,
    pub session_markers: Option<Vec<String>>,
    pub user_headers: Option<Vec<String>>,
    pub user_markers: Option<Vec<String>>,
}

fn lowercase(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl IdentityConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileIdentity>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            default_user: file
                .default_user
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.default_user),
            session_headers: lowercase(file.session_headers.unwrap_or(defaults.session_headers)),
            session_markers: lowercase(file.session_markers.unwrap_or(defaults.session_markers)),
            user_headers: lowercase(file.user_headers.unwrap_or(defaults.user_headers)),
            user_markers: lowercase(file.user_markers.unwrap_or(defaults.user_markers)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pacing
// ─────────────────────────────────────────────────────────────────────────────

/// One step of the pacing function: backlog strictly above `above` waits `delay_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingTier {
    pub above: usize,
    pub delay_ms: u64,
}

/// Per-character delay schedule for the stream relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacingConfig {
    /// Steps, largest threshold first
    pub tiers: Vec<PacingTier>,
    /// Delay when the backlog is below every tier
    pub ceiling_ms: u64,
    /// Delay used to flush the queue on stream end
    pub floor_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                PacingTier { above: 30, delay_ms: 1 },
                PacingTier { above: 20, delay_ms: 2 },
                PacingTier { above: 10, delay_ms: 10 },
            ],
            ceiling_ms: 20,
            floor_ms: 1,
        }
    }
}

/// Pacing settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FilePacing {
    pub tiers: Option<Vec<PacingTier>>,
    pub ceiling_ms: Option<u64>,
    pub floor_ms: Option<u64>,
}

impl PacingConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FilePacing>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let mut tiers = file.tiers.unwrap_or(defaults.tiers);
        tiers.sort_by(|a, b| b.above.cmp(&a.above));

        Self {
            tiers,
            ceiling_ms: file.ceiling_ms.unwrap_or(defaults.ceiling_ms),
            floor_ms: file.floor_ms.unwrap_or(defaults.floor_ms),
        }
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.floor_ms > self.ceiling_ms {
            return Err(ConfigError::InvalidPacing(format!(
                "floor_ms ({}) exceeds ceiling_ms ({})",
                self.floor_ms, self.ceiling_ms
            )));
        }
        if let Some(tier) = self
            .tiers
            .iter()
            .find(|t| t.delay_ms < self.floor_ms || t.delay_ms > self.ceiling_ms)
        {
            return Err(ConfigError::InvalidPacing(format!(
                "tier above {} has delay {}ms outside [{}, {}]",
                tier.above, tier.delay_ms, self.floor_ms, self.ceiling_ms
            )));
        }
        Ok(())
    }
}
