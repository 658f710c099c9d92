//! One-shot migration of legacy JSON mapping files into the store
//!
//! Older deployments kept mappings in a flat JSON object keyed by session key.
//! Values are either a bare upstream id or an object carrying the id and
//! optional timestamps.

use super::{now_secs, MappingStore, StoreError};
use rusqlite::params;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Outcome of an import run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ImportReport {
    /// Rows inserted
    pub imported: usize,
    /// Entries left alone (key already mapped, or value unusable)
    pub skipped: usize,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyValue {
    Id(String),
    Record {
        #[serde(alias = "dify_conversation_id", alias = "conversation_id")]
        upstream_conversation_id: Option<String>,
        #[serde(default)]
        created_at: Option<serde_json::Value>,
        #[serde(default)]
        last_used: Option<serde_json::Value>,
    },
    Other(serde_json::Value),
}

struct Entry {
    session_key: String,
    upstream_conversation_id: String,
    created_at: i64,
    last_used: i64,
}

impl MappingStore {
    /// Import a legacy JSON mapping file; existing rows are never overwritten
    pub fn import_json(&self, path: &Path) -> Result<ImportReport, StoreError> {
        let text = std::fs::read_to_string(path)?;
        let raw: BTreeMap<String, LegacyValue> = serde_json::from_str(&text)?;
        let now = now_secs();

        let mut report = ImportReport::default();
        let mut entries = Vec::with_capacity(raw.len());
        for (session_key, value) in raw {
            match normalize(session_key, value, now) {
                Some(entry) => entries.push(entry),
                None => report.skipped += 1,
            }
        }

        let inserted = self.with_conn("import_json", |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO conversation_mappings
                         (session_key, upstream_conversation_id, created_at, last_used, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(session_key) DO NOTHING",
                )?;
                for e in &entries {
                    inserted += stmt.execute(params![
                        e.session_key,
                        e.upstream_conversation_id,
                        e.created_at,
                        e.last_used,
                        now
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })?;

        report.imported = inserted;
        report.skipped += entries.len() - inserted;

        tracing::info!(
            "Imported {} mapping(s) from {} ({} skipped)",
            report.imported,
            path.display(),
            report.skipped
        );
        Ok(report)
    }
}

fn normalize(session_key: String, value: LegacyValue, now: i64) -> Option<Entry> {
    if session_key.trim().is_empty() {
        return None;
    }

    let (id, created_at, last_used) = match value {
        LegacyValue::Id(id) => (id, now, now),
        LegacyValue::Record {
            upstream_conversation_id: Some(id),
            created_at,
            last_used,
        } => {
            let created = created_at.as_ref().and_then(epoch_secs).unwrap_or(now);
            let used = last_used.as_ref().and_then(epoch_secs).unwrap_or(created);
            (id, created, used.max(created))
        }
        LegacyValue::Record { .. } | LegacyValue::Other(_) => {
            tracing::warn!("Skipping legacy mapping with unusable value");
            return None;
        }
    };

    if id.trim().is_empty() {
        return None;
    }

    Some(Entry {
        session_key,
        upstream_conversation_id: id,
        created_at,
        last_used,
    })
}

/// Legacy timestamps: integer or fractional epoch seconds, numeric strings,
/// or RFC 3339 text. Anything else is treated as missing.
fn epoch_secs(value: &serde_json::Value) -> Option<i64> {
    use serde_json::Value;

    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
                .or_else(|| {
                    chrono::DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|dt| dt.timestamp())
                })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::super::StoreOptions;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_import_mixed_value_shapes() {
        let dir = TempDir::new().unwrap();
        let store = MappingStore::open(StoreOptions {
            db_path: dir.path().join("m.db"),
            ..StoreOptions::default()
        })
        .unwrap();
        store.create_if_absent_at("existing", "conv-keep", 50).unwrap();

        let json = dir.path().join("legacy.json");
        std::fs::write(
            &json,
            r#"{
                "plain": "conv-1",
                "object": {"dify_conversation_id": "conv-2", "created_at": 100, "last_used": 150},
                "existing": "conv-replace",
                "broken": 42,
                "no-id": {"created_at": 5}
            }"#,
        )
        .unwrap();

        let report = store.import_json(&json).unwrap();
        assert_eq!(report, ImportReport { imported: 2, skipped: 3 });

        assert_eq!(store.lookup("plain").unwrap().as_deref(), Some("conv-1"));
        let row = store.get("object").unwrap().unwrap();
        assert_eq!(row.upstream_conversation_id, "conv-2");
        assert_eq!(row.created_at, 100);
        assert_eq!(row.last_used, 150);
        assert_eq!(store.lookup("existing").unwrap().as_deref(), Some("conv-keep"));
    }

    #[test]
    fn test_import_tolerates_odd_timestamps() {
        let dir = TempDir::new().unwrap();
        let store = MappingStore::open(StoreOptions {
            db_path: dir.path().join("m.db"),
            ..StoreOptions::default()
        })
        .unwrap();

        let json = dir.path().join("legacy.json");
        std::fs::write(
            &json,
            r#"{
                "float": {"dify_conversation_id": "conv-1", "created_at": 1718000000.123, "last_used": 1718000100.5},
                "text": {"dify_conversation_id": "conv-2", "created_at": "1718000000", "last_used": "2024-06-10T06:15:00Z"},
                "junk": {"dify_conversation_id": "conv-3", "created_at": "yesterday", "last_used": null}
            }"#,
        )
        .unwrap();

        let report = store.import_json(&json).unwrap();
        assert_eq!(report, ImportReport { imported: 3, skipped: 0 });

        let row = store.get("float").unwrap().unwrap();
        assert_eq!(row.upstream_conversation_id, "conv-1");
        assert_eq!(row.created_at, 1_718_000_000);
        assert_eq!(row.last_used, 1_718_000_100);

        let row = store.get("text").unwrap().unwrap();
        assert_eq!(row.created_at, 1_718_000_000);
        assert_eq!(row.last_used, 1_718_000_100);

        let row = store.get("junk").unwrap().unwrap();
        assert_eq!(row.upstream_conversation_id, "conv-3");
        assert!(row.last_used >= row.created_at);
    }

    #[test]
    fn test_import_rejects_non_object_file() {
        let dir = TempDir::new().unwrap();
        let store = MappingStore::open(StoreOptions {
            db_path: dir.path().join("m.db"),
            ..StoreOptions::default()
        })
        .unwrap();

        let json = dir.path().join("legacy.json");
        std::fs::write(&json, "[1, 2, 3]").unwrap();

        assert!(matches!(store.import_json(&json), Err(StoreError::Json(_))));
    }
}
