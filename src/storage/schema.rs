//! Mapping table schema and self-healing initialization
//!
//! Several worker processes may open the same database file at once, so
//! initialization runs inside an IMMEDIATE transaction and every DDL statement
//! is idempotent. A table left behind by an older schema (missing one of the
//! required columns) is renamed aside, recreated, and its rows are copied
//! across on a best-effort basis.

use rusqlite::{Connection, TransactionBehavior};

/// Name of the mapping table
pub const TABLE: &str = "conversation_mappings";

/// Temporary name for a table being migrated away from
const LEGACY_TABLE: &str = "conversation_mappings_legacy";

/// Columns the current schema requires
pub const REQUIRED_COLUMNS: &[&str] = &[
    "session_key",
    "upstream_conversation_id",
    "created_at",
    "last_used",
    "updated_at",
];

/// Column names older schemas used for the session key, newest first
const LEGACY_KEY_COLUMNS: &[&str] = &["session_key", "webui_chat_id", "chat_id"];

/// Column names older schemas used for the upstream id, newest first
const LEGACY_ID_COLUMNS: &[&str] = &[
    "upstream_conversation_id",
    "dify_conversation_id",
    "conversation_id",
];

const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS conversation_mappings (
        session_key TEXT PRIMARY KEY,
        upstream_conversation_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        last_used INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_mappings_last_used ON conversation_mappings(last_used);
    CREATE INDEX IF NOT EXISTS idx_mappings_created_at ON conversation_mappings(created_at);
";

/// What `initialize` had to do to bring the table up to date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOutcome {
    /// Table already had the expected columns
    Current,
    /// Table did not exist and was created
    Created,
    /// Table was rebuilt from an older layout; `copied` rows survived
    Rebuilt { copied: usize },
}

/// Ensure the mapping table exists with the required columns
pub fn initialize(conn: &mut Connection, now: i64) -> rusqlite::Result<SchemaOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing = table_columns(&tx, TABLE)?;
    let outcome = if existing.is_empty() {
        tx.execute_batch(CREATE_TABLE)?;
        SchemaOutcome::Created
    } else {
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|c| !existing.iter().any(|e| e == c))
            .collect();

        if missing.is_empty() {
            // Indexes may predate this version
            tx.execute_batch(CREATE_TABLE)?;
            SchemaOutcome::Current
        } else {
            tracing::warn!(
                "Mapping table is missing columns {:?}, rebuilding with current layout",
                missing
            );
            let copied = rebuild(&tx, &existing, now)?;
            SchemaOutcome::Rebuilt { copied }
        }
    };

    tx.commit()?;
    Ok(outcome)
}

/// Column names of `table`, empty if the table does not exist
pub fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let rows = stmt.query_map([table], |row| row.get::<_, String>(0))?;
    rows.collect()
}

/// Rename the old table aside, create the new one, copy what can be copied
fn rebuild(conn: &Connection, old_columns: &[String], now: i64) -> rusqlite::Result<usize> {
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {LEGACY_TABLE};
         ALTER TABLE {TABLE} RENAME TO {LEGACY_TABLE};
         DROP INDEX IF EXISTS idx_mappings_last_used;
         DROP INDEX IF EXISTS idx_mappings_created_at;"
    ))?;
    conn.execute_batch(CREATE_TABLE)?;

    let copied = match copy_statement(old_columns) {
        Some(sql) => match conn.execute(&sql, [now]) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Failed to copy rows from legacy mapping table: {}", e);
                0
            }
        },
        None => {
            tracing::warn!(
                "Legacy mapping table has no recognizable key/id columns ({:?}), rows not copied",
                old_columns
            );
            0
        }
    };

    conn.execute_batch(&format!("DROP TABLE {LEGACY_TABLE}"))?;
    tracing::info!("Rebuilt mapping table, {} row(s) carried over", copied);
    Ok(copied)
}

/// Build the INSERT ... SELECT that carries rows out of the legacy table
///
/// Missing timestamps default to `?1` (now). Returns None when the legacy
/// table has no usable key or id column.
fn copy_statement(old_columns: &[String]) -> Option<String> {
    let has = |name: &str| old_columns.iter().any(|c| c == name);
    let key = LEGACY_KEY_COLUMNS.iter().find(|c| has(c))?;
    let id = LEGACY_ID_COLUMNS.iter().find(|c| has(c))?;

    let created = if has("created_at") {
        "COALESCE(created_at, ?1)".to_string()
    } else {
        "?1".to_string()
    };
    let last_used = match (has("last_used"), has("created_at")) {
        (true, true) => "COALESCE(last_used, created_at, ?1)",
        (true, false) => "COALESCE(last_used, ?1)",
        (false, true) => "COALESCE(created_at, ?1)",
        (false, false) => "?1",
    };

    Some(format!(
        "INSERT OR IGNORE INTO {TABLE}
            (session_key, upstream_conversation_id, created_at, last_used, updated_at)
         SELECT {key}, {id}, {created}, {last_used}, ?1
         FROM {LEGACY_TABLE}
         WHERE {key} IS NOT NULL AND {id} IS NOT NULL"
    ))
}
