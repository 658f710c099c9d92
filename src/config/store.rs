//! Session mapping store configuration

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use super::ConfigError;
use crate::storage::{MappingPolicy, RetryPolicy, StoreOptions};

/// Session mapping store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to SQLite database file, shared by every worker on the host
    pub db_path: PathBuf,
    /// SQLite busy_timeout in milliseconds
    pub busy_timeout_ms: u64,
    /// Attempts per store operation, including the first
    pub max_attempts: u32,
    /// First backoff delay (milliseconds); doubles per retry
    pub base_delay_ms: u64,
    /// Backoff ceiling (milliseconds)
    pub max_delay_ms: u64,
    /// Pooled connections per process
    pub pool_size: u32,
    /// Behavior when a mapping already exists for a key
    pub mapping_policy: MappingPolicy,
    /// Automatic retention sweep age in days (0 = disabled)
    pub retention_days: u32,
    /// Seconds between retention sweeps
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/conversation_mappings.db"),
            busy_timeout_ms: 60_000,
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            pool_size: 8,
            mapping_policy: MappingPolicy::FirstWriterWins,
            retention_days: 0,
            sweep_interval_secs: 86_400,
        }
    }
}

/// Store settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileStore {
    pub db_path: Option<String>,
    pub busy_timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub pool_size: Option<u32>,
    pub mapping_policy: Option<String>,
    pub retention_days: Option<u32>,
    pub sweep_interval_secs: Option<u64>,
}

impl StoreConfig {
    /// Create from file config with defaults
    ///
    /// Unlike log rotation, an unknown mapping policy is rejected: silently
    /// falling back would change which conversation a session continues.
    pub fn from_file(file: Option<FileStore>) -> Result<Self, ConfigError> {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let mapping_policy = match file.mapping_policy {
            Some(s) => MappingPolicy::parse(&s).ok_or(ConfigError::InvalidMappingPolicy(s))?,
            None => defaults.mapping_policy,
        };

        Ok(Self {
            db_path: file
                .db_path
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            busy_timeout_ms: file.busy_timeout_ms.unwrap_or(defaults.busy_timeout_ms),
            max_attempts: file.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            base_delay_ms: file.base_delay_ms.unwrap_or(defaults.base_delay_ms),
            max_delay_ms: file.max_delay_ms.unwrap_or(defaults.max_delay_ms),
            pool_size: file.pool_size.unwrap_or(defaults.pool_size).max(1),
            mapping_policy,
            retention_days: file.retention_days.unwrap_or(defaults.retention_days),
            sweep_interval_secs: file
                .sweep_interval_secs
                .unwrap_or(defaults.sweep_interval_secs)
                .max(1),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
        }
    }

    /// Options for `MappingStore::open`
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            db_path: self.db_path.clone(),
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            retry: self.retry_policy(),
            pool_size: self.pool_size,
        }
    }

    /// Retention age, None when the automatic sweep is disabled
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_days > 0)
            .then(|| Duration::from_secs(u64::from(self.retention_days) * 86_400))
    }
}
