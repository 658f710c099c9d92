//! Configuration for the gateway
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file ($CHATBRIDGE_CONFIG or ~/.config/chatbridge/config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! Loading only parses. `Config::validate` is the fail-closed gate that runs
//! before the server binds a listener; offline maintenance commands skip it.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod gateway;
mod observability;
mod serialization;
mod store;
mod upstream;


// ─────────────────────────────────────────────────────────────────────────────
// Re-exports
// ─────────────────────────────────────────────────────────────────────────────

pub use gateway::{FileIdentity, FilePacing, IdentityConfig, PacingConfig};
pub use observability::{FileLogging, LoggingConfig};
pub use store::{FileStore, StoreConfig};
pub use upstream::{Credential, FileUpstream, ModelRegistry, UpstreamConfig};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_BIND: &str = "127.0.0.1:5000";

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration failures; every one of them is fatal at startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("upstream base URL is not configured (set UPSTREAM_API_BASE or [upstream] base_url)")]
    MissingUpstreamUrl,

    #[error("invalid upstream base URL '{0}': must be an absolute http(s) URL")]
    InvalidUpstreamUrl(String),

    #[error("no models configured (set MODEL_CONFIG or a [models] table)")]
    NoModels,

    #[error("credential for model '{0}' must be a string")]
    NonStringCredential(String),

    #[error("credential for model '{0}' is empty")]
    EmptyCredential(String),

    #[error("MODEL_CONFIG must be a JSON object mapping model name to credential")]
    ModelConfigNotObject,

    #[error("MODEL_CONFIG is not valid JSON: {0}")]
    ModelConfigJson(#[source] serde_json::Error),

    #[error("unknown mapping policy '{0}' (expected first_writer_wins or upsert)")]
    InvalidMappingPolicy(String),

    #[error("invalid pacing configuration: {0}")]
    InvalidPacing(String),

    #[error("upstream.max_connections must be between 1 and {max}, got {value}")]
    InvalidPoolLimit { value: usize, max: usize },
}

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the gateway to
    pub bind_addr: SocketAddr,

    /// Upstream service location, timeouts and pool bounds
    pub upstream: UpstreamConfig,

    /// Model name → upstream credential
    pub models: ModelRegistry,

    /// Session mapping store settings
    pub store: StoreConfig,

    /// Where session and user identity hints are looked for
    pub identity: IdentityConfig,

    /// Stream relay pacing
    pub pacing: PacingConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            upstream: UpstreamConfig::default(),
            models: ModelRegistry::default(),
            store: StoreConfig::default(),
            identity: IdentityConfig::default(),
            pacing: PacingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,

    /// Optional [upstream] section
    pub upstream: Option<FileUpstream>,

    /// Optional [models] table; values are checked to be strings
    pub models: Option<BTreeMap<String, toml::Value>>,

    /// Optional [store] section
    pub store: Option<FileStore>,

    /// Optional [identity] section
    pub identity: Option<FileIdentity>,

    /// Optional [pacing] section
    pub pacing: Option<FilePacing>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: $CHATBRIDGE_CONFIG, else ~/.config/chatbridge/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os("CHATBRIDGE_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|p| p.join(".config").join("chatbridge").join("config.toml"))
    }

    /// Load file config if it exists
    ///
    /// A missing file means defaults. A file that exists but cannot be read or
    /// parsed is an error.
    fn load_file_config() -> Result<FileConfig, ConfigError> {
        let Some(path) = Self::config_path() else {
            return Ok(FileConfig::default());
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    /// Load configuration: env vars > file > defaults
    pub fn load() -> Result<Self, ConfigError> {
        let file = Self::load_file_config()?;
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Merge a parsed file with an environment lookup
    pub(crate) fn from_sources(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        // Bind address: env > file > default
        let bind = env("CHATBRIDGE_BIND")
            .or(file.bind_addr)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind_addr = bind
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind.clone(),
                source,
            })?;

        // Upstream URL: env > file
        let mut upstream = UpstreamConfig::from_file(file.upstream);
        if let Some(url) = env("UPSTREAM_API_BASE") {
            upstream.base_url = Some(url);
        }

        // Models: env replaces the file table wholesale
        let models = match env("MODEL_CONFIG") {
            Some(json) => ModelRegistry::from_json(&json)?,
            None => ModelRegistry::from_toml(file.models.unwrap_or_default())?,
        };

        let mut store = StoreConfig::from_file(file.store)?;
        if let Some(path) = env("CHATBRIDGE_DB_PATH") {
            store.db_path = PathBuf::from(path);
        }

        let identity = IdentityConfig::from_file(file.identity);
        let pacing = PacingConfig::from_file(file.pacing);

        let mut logging = LoggingConfig::from_file(file.logging);
        if let Some(level) = env("CHATBRIDGE_LOG_LEVEL") {
            logging.level = level;
        }

        Ok(Self {
            bind_addr,
            upstream,
            models,
            store,
            identity,
            pacing,
            logging,
        })
    }

    /// Check everything the server needs before it accepts traffic
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.upstream.validate()?;
        self.models.validate()?;
        self.pacing.validate()?;
        Ok(())
    }
}
