//! Gateway state types and the async bridge to the mapping store

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::ModelRegistry;
use crate::storage::{MappingPolicy, MappingStore, MappingWrite, StoreError};
use crate::util::short_id;

use super::identity::IdentityExtractor;
use super::relay::PacingPolicy;

// ─────────────────────────────────────────────────────────────────────────────
// Gateway State
// ─────────────────────────────────────────────────────────────────────────────

/// Shared state for the gateway server
///
/// Built once at startup; every field is immutable or internally synchronized.
#[derive(Clone)]
pub struct GatewayState {
    /// Pooled HTTP client for upstream calls
    pub(super) client: reqwest::Client,
    /// `{upstream}/chat-messages`
    pub(super) chat_messages_url: Arc<str>,
    /// Model name → upstream credential
    pub(super) models: Arc<ModelRegistry>,
    /// Session key / user id resolution rules
    pub(super) identity: Arc<IdentityExtractor>,
    /// Session mapping store access
    pub mappings: SessionMapper,
    /// Stream relay pacing
    pub(super) pacing: Arc<PacingPolicy>,
    /// Bounds concurrent upstream calls; one permit per call or stream
    pub(super) permits: Arc<Semaphore>,
    /// Process start, epoch seconds (reported as model creation time)
    pub(super) started_at: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Binding
// ─────────────────────────────────────────────────────────────────────────────

/// What the mapping store said about this request's session before the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionBinding {
    /// No session key: no continuity, nothing to record
    Stateless,
    /// The key already maps to an upstream conversation
    Existing {
        session_key: String,
        conversation_id: String,
    },
    /// The key is known but not mapped yet
    Unmapped { session_key: String },
}

impl SessionBinding {
    /// Upstream conversation to continue, if any
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Existing {
                conversation_id, ..
            } => Some(conversation_id),
            _ => None,
        }
    }

    pub fn session_key(&self) -> Option<&str> {
        match self {
            Self::Stateless => None,
            Self::Existing { session_key, .. } | Self::Unmapped { session_key } => {
                Some(session_key)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Mapper
// ─────────────────────────────────────────────────────────────────────────────

/// Async, soft-failing front of the mapping store
///
/// Store calls run on the blocking pool. Failures are logged and degrade to
/// "no continuity for this turn"; they never fail the client request.
#[derive(Clone)]
pub struct SessionMapper {
    store: Arc<MappingStore>,
    policy: MappingPolicy,
}

impl SessionMapper {
    pub fn new(store: Arc<MappingStore>, policy: MappingPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    /// Run a store operation on the blocking pool
    pub async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&MappingStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Look up the session's mapping before calling upstream
    pub async fn resolve(&self, session_key: Option<String>) -> SessionBinding {
        let Some(session_key) = session_key else {
            return SessionBinding::Stateless;
        };

        let key = session_key.clone();
        match self.run(move |store| store.lookup(&key)).await {
            Ok(Some(conversation_id)) => {
                tracing::debug!(
                    "Session {} continues upstream conversation {}",
                    short_id(&session_key),
                    short_id(&conversation_id)
                );
                SessionBinding::Existing {
                    session_key,
                    conversation_id,
                }
            }
            Ok(None) => {
                tracing::debug!("Session {} has no mapping yet", short_id(&session_key));
                SessionBinding::Unmapped { session_key }
            }
            Err(e) => {
                tracing::warn!(
                    "Mapping lookup failed for session {}, continuing without continuity: {}",
                    short_id(&session_key),
                    e
                );
                SessionBinding::Unmapped { session_key }
            }
        }
    }

    /// Record the outcome of a successful upstream exchange
    ///
    /// Existing mappings are touched. A new mapping is written only when the
    /// upstream reported a conversation id.
    pub async fn commit(&self, binding: &SessionBinding, conversation_id: Option<&str>) {
        let result = match (binding, conversation_id) {
            (SessionBinding::Stateless, _) => return,

            (
                SessionBinding::Existing {
                    session_key,
                    conversation_id: mapped,
                },
                reported,
            ) => match reported {
                Some(new_id) if new_id != mapped.as_str() && self.policy == MappingPolicy::Upsert => {
                    self.record(session_key, new_id).await
                }
                _ => {
                    if let Some(new_id) = reported.filter(|id| *id != mapped.as_str()) {
                        tracing::warn!(
                            "Upstream answered session {} from conversation {}, keeping mapping to {}",
                            short_id(session_key),
                            short_id(new_id),
                            short_id(mapped)
                        );
                    }
                    let key = session_key.clone();
                    self.run(move |store| store.touch(&key)).await
                }
            },

            (SessionBinding::Unmapped { session_key }, Some(new_id)) => {
                self.record(session_key, new_id).await
            }

            (SessionBinding::Unmapped { session_key }, None) => {
                tracing::debug!(
                    "Upstream reported no conversation id, session {} stays unmapped",
                    short_id(session_key)
                );
                return;
            }
        };

        if let Err(e) = result {
            tracing::warn!(
                "Mapping update failed for session {}: {}",
                short_id(binding.session_key().unwrap_or_default()),
                e
            );
        }
    }

    async fn record(&self, session_key: &str, conversation_id: &str) -> Result<(), StoreError> {
        let (key, id, policy) = (
            session_key.to_string(),
            conversation_id.to_string(),
            self.policy,
        );
        let write = self
            .run(move |store| store.record(&key, &id, policy))
            .await?;
        if write == MappingWrite::Kept {
            tracing::debug!(
                "Session {} was mapped concurrently, kept the first mapping",
                short_id(session_key)
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreOptions;
    use tempfile::TempDir;

    fn mapper(dir: &TempDir, policy: MappingPolicy) -> SessionMapper {
        let store = MappingStore::open(StoreOptions {
            db_path: dir.path().join("m.db"),
            ..StoreOptions::default()
        })
        .unwrap();
        SessionMapper::new(Arc::new(store), policy)
    }

    #[tokio::test]
    async fn test_resolve_and_commit_new_mapping() {
        let dir = TempDir::new().unwrap();
        let mapper = mapper(&dir, MappingPolicy::FirstWriterWins);

        assert_eq!(mapper.resolve(None).await, SessionBinding::Stateless);

        let binding = mapper.resolve(Some("chat-1".into())).await;
        assert_eq!(
            binding,
            SessionBinding::Unmapped {
                session_key: "chat-1".into()
            }
        );

        mapper.commit(&binding, Some("conv-1")).await;
        assert_eq!(
            mapper.resolve(Some("chat-1".into())).await.conversation_id(),
            Some("conv-1")
        );
    }

    #[tokio::test]
    async fn test_existing_mapping_is_not_repointed_by_default() {
        let dir = TempDir::new().unwrap();
        let mapper = mapper(&dir, MappingPolicy::FirstWriterWins);
        mapper.store().create_if_absent("chat-1", "conv-1").unwrap();

        let binding = mapper.resolve(Some("chat-1".into())).await;
        mapper.commit(&binding, Some("conv-other")).await;

        assert_eq!(
            mapper.store().lookup("chat-1").unwrap().as_deref(),
            Some("conv-1")
        );
    }

    #[tokio::test]
    async fn test_upsert_policy_repoints() {
        let dir = TempDir::new().unwrap();
        let mapper = mapper(&dir, MappingPolicy::Upsert);
        mapper.store().create_if_absent("chat-1", "conv-1").unwrap();

        let binding = mapper.resolve(Some("chat-1".into())).await;
        mapper.commit(&binding, Some("conv-2")).await;

        assert_eq!(
            mapper.store().lookup("chat-1").unwrap().as_deref(),
            Some("conv-2")
        );
    }

    #[tokio::test]
    async fn test_unmapped_without_conversation_id_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mapper = mapper(&dir, MappingPolicy::FirstWriterWins);

        let binding = mapper.resolve(Some("chat-1".into())).await;
        mapper.commit(&binding, None).await;

        assert_eq!(mapper.store().count().unwrap(), 0);
    }
}
