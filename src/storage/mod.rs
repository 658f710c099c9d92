//! Session mapping store - durable session key → upstream conversation id
//!
//! Backed by a single SQLite table shared by every worker process on the host.
//!
//! # Architecture
//!
//! ```text
//! Gateway handlers / Stream relay (async)
//!         │
//!         └──→ spawn_blocking
//!                 │
//!                 └──→ MappingStore (r2d2 pool, one per process)
//!                         │
//!                         └──→ RetryPolicy (busy → exponential backoff)
//!                                 │
//!                                 └──→ SQLite (WAL, busy_timeout, synchronous=FULL)
//! ```
//!
//! # Concurrency
//!
//! Every public operation is one short statement or one short transaction.
//! Nothing here is ever held across a network call. WAL mode lets readers
//! proceed while another process writes; writers wait on `busy_timeout` and
//! then fall back to the retry policy.

mod import;
mod retry;
pub mod schema;

pub use retry::RetryPolicy;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::util::short_id;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failures surfaced by the mapping store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Contention outlasted the retry budget
    #[error("database still busy after {attempts} attempt(s)")]
    Busy { attempts: u32 },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The blocking task running the operation panicked or was cancelled
    #[error("store task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Whether this failure is lock contention worth retrying
    pub fn is_contention(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            // Checkout timed out because every connection was busy
            StoreError::Pool(_) => true,
            _ => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// One row of the mapping table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMapping {
    pub session_key: String,
    pub upstream_conversation_id: String,
    pub created_at: i64,
    pub last_used: i64,
    pub updated_at: i64,
}

/// Aggregate view of the table; every field but `total` is None when empty
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MappingStats {
    pub total: u64,
    pub oldest_created_at: Option<i64>,
    pub newest_created_at: Option<i64>,
    pub avg_last_used: Option<i64>,
}

/// Physical details of the backing file, for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub path: PathBuf,
    pub size_bytes: i64,
    pub journal_mode: String,
    pub tables: Vec<String>,
    pub mapping_count: u64,
}

/// How a mapping write treats an existing row for the same key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingPolicy {
    /// The first write for a key is permanent; later writes are no-ops
    #[default]
    FirstWriterWins,
    /// Later writes repoint the key, preserving `created_at`
    Upsert,
}

impl MappingPolicy {
    /// Parse policy string from config
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "first_writer_wins" => Some(Self::FirstWriterWins),
            "upsert" => Some(Self::Upsert),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstWriterWins => "first_writer_wins",
            Self::Upsert => "upsert",
        }
    }
}

/// Result of `MappingStore::record`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingWrite {
    /// A new row was inserted
    Created,
    /// A row already existed and was left pointing where it was
    Kept,
    /// A row already existed and now points at the new id
    Repointed,
}

/// Options for opening a store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Path to SQLite database file
    pub db_path: PathBuf,
    /// How long SQLite itself waits on a locked database before reporting busy
    pub busy_timeout: Duration,
    /// Backoff applied once SQLite gives up
    pub retry: RetryPolicy,
    /// Maximum pooled connections in this process
    pub pool_size: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/conversation_mappings.db"),
            busy_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            pool_size: 8,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Durable, multi-process safe session mapping store
pub struct MappingStore {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
    retry: RetryPolicy,
}

/// Current wall clock in epoch seconds
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl MappingStore {
    /// Open (creating if needed) the store at `options.db_path`
    ///
    /// Verifies the table layout and rebuilds it if it was written by an
    /// older schema.
    pub fn open(options: StoreOptions) -> Result<Self, StoreError> {
        if let Some(parent) = options.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let busy_timeout = options.busy_timeout;
        let manager = SqliteConnectionManager::file(&options.db_path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            // journal_mode returns the resulting mode as a row
            let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            conn.execute_batch(
                "PRAGMA synchronous=FULL;
                 PRAGMA foreign_keys=ON;",
            )
        });

        // min_idle = 0: connections are opened lazily, inside the retry policy
        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .min_idle(Some(0))
            .connection_timeout(busy_timeout.max(Duration::from_secs(1)))
            .build(manager)?;

        let store = Self {
            pool,
            path: options.db_path,
            retry: options.retry,
        };

        let outcome = store.with_conn("initialize", |conn| schema::initialize(conn, now_secs()))?;
        tracing::info!(
            "Mapping store ready at {} ({:?}, {} mapping(s))",
            store.path.display(),
            outcome,
            store.count()?
        );

        Ok(store)
    }

    /// Path of the backing database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check out a connection and run `f`, retrying on contention
    fn with_conn<T>(
        &self,
        name: &str,
        f: impl Fn(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        self.retry.run(name, || {
            let mut conn = self.pool.get()?;
            f(&mut conn).map_err(StoreError::from)
        })
    }

    /// Upstream conversation id for a session key
    pub fn lookup(&self, session_key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn("lookup", |conn| {
            conn.query_row(
                "SELECT upstream_conversation_id FROM conversation_mappings WHERE session_key = ?1",
                [session_key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Full row for a session key
    pub fn get(&self, session_key: &str) -> Result<Option<SessionMapping>, StoreError> {
        self.with_conn("get", |conn| {
            conn.query_row(
                "SELECT session_key, upstream_conversation_id, created_at, last_used, updated_at
                 FROM conversation_mappings WHERE session_key = ?1",
                [session_key],
                map_row,
            )
            .optional()
        })
    }

    /// Insert a mapping unless one exists; true if a row was inserted
    pub fn create_if_absent(
        &self,
        session_key: &str,
        upstream_conversation_id: &str,
    ) -> Result<bool, StoreError> {
        self.create_if_absent_at(session_key, upstream_conversation_id, now_secs())
    }

    pub(crate) fn create_if_absent_at(
        &self,
        session_key: &str,
        upstream_conversation_id: &str,
        now: i64,
    ) -> Result<bool, StoreError> {
        let inserted = self.with_conn("create_if_absent", |conn| {
            conn.execute(
                "INSERT INTO conversation_mappings
                     (session_key, upstream_conversation_id, created_at, last_used, updated_at)
                 VALUES (?1, ?2, ?3, ?3, ?3)
                 ON CONFLICT(session_key) DO NOTHING",
                params![session_key, upstream_conversation_id, now],
            )
        })? > 0;

        if inserted {
            tracing::info!(
                "Mapped session {} to upstream conversation {}",
                short_id(session_key),
                short_id(upstream_conversation_id)
            );
        } else {
            tracing::debug!(
                "Session {} already mapped, keeping existing upstream conversation",
                short_id(session_key)
            );
        }
        Ok(inserted)
    }

    /// Insert or repoint a mapping, preserving `created_at` of an existing row
    pub fn upsert(
        &self,
        session_key: &str,
        upstream_conversation_id: &str,
    ) -> Result<MappingWrite, StoreError> {
        let now = now_secs();
        self.with_conn("upsert", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let previous: Option<String> = tx
                .query_row(
                    "SELECT upstream_conversation_id FROM conversation_mappings WHERE session_key = ?1",
                    [session_key],
                    |row| row.get(0),
                )
                .optional()?;

            tx.execute(
                "INSERT INTO conversation_mappings
                     (session_key, upstream_conversation_id, created_at, last_used, updated_at)
                 VALUES (?1, ?2, ?3, ?3, ?3)
                 ON CONFLICT(session_key) DO UPDATE SET
                     upstream_conversation_id = excluded.upstream_conversation_id,
                     last_used = MAX(last_used, excluded.last_used),
                     updated_at = excluded.updated_at",
                params![session_key, upstream_conversation_id, now],
            )?;
            tx.commit()?;

            Ok(match previous {
                None => MappingWrite::Created,
                Some(prev) if prev == upstream_conversation_id => MappingWrite::Kept,
                Some(_) => MappingWrite::Repointed,
            })
        })
    }

    /// Write a mapping under the given policy
    pub fn record(
        &self,
        session_key: &str,
        upstream_conversation_id: &str,
        policy: MappingPolicy,
    ) -> Result<MappingWrite, StoreError> {
        match policy {
            MappingPolicy::FirstWriterWins => {
                if self.create_if_absent(session_key, upstream_conversation_id)? {
                    Ok(MappingWrite::Created)
                } else {
                    Ok(MappingWrite::Kept)
                }
            }
            MappingPolicy::Upsert => {
                let write = self.upsert(session_key, upstream_conversation_id)?;
                if write == MappingWrite::Repointed {
                    tracing::warn!(
                        "Session {} repointed to upstream conversation {}",
                        short_id(session_key),
                        short_id(upstream_conversation_id)
                    );
                }
                Ok(write)
            }
        }
    }

    /// Refresh `last_used`/`updated_at`; no-op for an unknown key
    pub fn touch(&self, session_key: &str) -> Result<(), StoreError> {
        let now = now_secs();
        let updated = self.with_conn("touch", |conn| {
            conn.execute(
                "UPDATE conversation_mappings
                 SET last_used = MAX(last_used, ?1), updated_at = ?1
                 WHERE session_key = ?2",
                params![now, session_key],
            )
        })?;

        if updated > 0 {
            tracing::debug!("Touched mapping for session {}", short_id(session_key));
        }
        Ok(())
    }

    /// Remove one mapping; true if a row was deleted
    pub fn delete(&self, session_key: &str) -> Result<bool, StoreError> {
        let deleted = self.with_conn("delete", |conn| {
            conn.execute(
                "DELETE FROM conversation_mappings WHERE session_key = ?1",
                [session_key],
            )
        })? > 0;

        if deleted {
            tracing::info!("Deleted mapping for session {}", short_id(session_key));
        }
        Ok(deleted)
    }

    /// Number of mappings
    pub fn count(&self) -> Result<u64, StoreError> {
        self.with_conn("count", |conn| {
            conn.query_row("SELECT COUNT(*) FROM conversation_mappings", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .map(|n| n.max(0) as u64)
    }

    /// Aggregate statistics over all mappings
    pub fn stats(&self) -> Result<MappingStats, StoreError> {
        self.with_conn("stats", |conn| {
            conn.query_row(
                "SELECT COUNT(*), MIN(created_at), MAX(created_at), AVG(last_used)
                 FROM conversation_mappings",
                [],
                |row| {
                    let total: i64 = row.get(0)?;
                    if total == 0 {
                        return Ok(MappingStats::default());
                    }
                    let avg: Option<f64> = row.get(3)?;
                    Ok(MappingStats {
                        total: total as u64,
                        oldest_created_at: row.get(1)?,
                        newest_created_at: row.get(2)?,
                        avg_last_used: avg.map(|a| a as i64),
                    })
                },
            )
        })
    }

    /// Most recently used mappings, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<SessionMapping>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn("recent", |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_key, upstream_conversation_id, created_at, last_used, updated_at
                 FROM conversation_mappings
                 ORDER BY last_used DESC, session_key ASC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], map_row)?;
            rows.collect()
        })
    }

    /// Delete mappings unused for at least `max_age`; returns rows removed
    pub fn purge(&self, max_age: Duration) -> Result<usize, StoreError> {
        self.purge_at(max_age, now_secs())
    }

    pub(crate) fn purge_at(&self, max_age: Duration, now: i64) -> Result<usize, StoreError> {
        let age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(age);

        let removed = self.with_conn("purge", |conn| {
            conn.execute(
                "DELETE FROM conversation_mappings WHERE last_used <= ?1",
                [cutoff],
            )
        })?;

        if removed > 0 {
            tracing::info!(
                "Purged {} mapping(s) unused for {}s or more",
                removed,
                max_age.as_secs()
            );
        }
        Ok(removed)
    }

    /// Refresh planner statistics and truncate the write-ahead log
    pub fn optimize(&self) -> Result<(), StoreError> {
        self.with_conn("optimize", |conn| {
            conn.execute_batch("ANALYZE conversation_mappings")?;
            // (busy, log frames, checkpointed frames)
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        })?;
        tracing::info!("Mapping store optimized");
        Ok(())
    }

    /// File size, journal mode and table list
    pub fn database_info(&self) -> Result<DatabaseInfo, StoreError> {
        let (size_bytes, journal_mode, tables) = self.with_conn("database_info", |conn| {
            let size: i64 = conn.query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )?;
            let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
            let tables = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((size, mode, tables))
        })?;

        Ok(DatabaseInfo {
            path: self.path.clone(),
            size_bytes,
            journal_mode,
            tables,
            mapping_count: self.count()?,
        })
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionMapping> {
    Ok(SessionMapping {
        session_key: row.get(0)?,
        upstream_conversation_id: row.get(1)?,
        created_at: row.get(2)?,
        last_used: row.get(3)?,
        updated_at: row.get(4)?,
    })
}
