// Mapping endpoints - Store statistics, retention cleanup, explicit deletion

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::proxy::error::GatewayError;
use crate::proxy::GatewayState;
use crate::storage::{now_secs, SessionMapping};
use crate::util::short_id;

/// Upper bound on `?recent=N`
const MAX_RECENT: usize = 100;

/// Default retention for POST /v1/conversation/cleanup
const DEFAULT_MAX_AGE_DAYS: u64 = 30;

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// Also return the N most recently used mappings
    #[serde(default)]
    pub recent: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MappingStatsResponse {
    pub total: u64,
    pub oldest_created_at: Option<i64>,
    pub newest_created_at: Option<i64>,
    pub avg_last_used: Option<i64>,
    /// When these numbers were taken
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent: Option<Vec<SessionMapping>>,
}

/// GET /v1/conversation/mappings
pub async fn mapping_stats(
    State(state): State<GatewayState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<MappingStatsResponse>, GatewayError> {
    let stats = state.mappings.run(|store| store.stats()).await?;

    let recent = match query.recent {
        Some(n) => {
            let limit = n.min(MAX_RECENT);
            Some(state.mappings.run(move |store| store.recent(limit)).await?)
        }
        None => None,
    };

    Ok(Json(MappingStatsResponse {
        total: stats.total,
        oldest_created_at: stats.oldest_created_at,
        newest_created_at: stats.newest_created_at,
        avg_last_used: stats.avg_last_used,
        timestamp: now_secs(),
        recent,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub max_age_days: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: usize,
    pub max_age_days: u64,
}

/// POST /v1/conversation/cleanup
///
/// An empty body means the default age.
pub async fn cleanup_mappings(
    State(state): State<GatewayState>,
    body: axum::body::Bytes,
) -> Result<Json<CleanupResponse>, GatewayError> {
    let request: CleanupRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CleanupRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::BadRequest(format!("Invalid cleanup request: {e}")))?
    };

    let max_age_days = request.max_age_days.unwrap_or(DEFAULT_MAX_AGE_DAYS);
    let max_age = Duration::from_secs(max_age_days.saturating_mul(86_400));
    let removed = state.mappings.run(move |store| store.purge(max_age)).await?;

    tracing::info!(
        "Cleanup removed {} mapping(s) older than {} day(s)",
        removed,
        max_age_days
    );
    Ok(Json(CleanupResponse {
        removed,
        max_age_days,
    }))
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

/// DELETE /v1/conversation/mappings/:session_key
pub async fn delete_mapping(
    State(state): State<GatewayState>,
    Path(session_key): Path<String>,
) -> Result<Json<DeleteResponse>, GatewayError> {
    let key = session_key.clone();
    let deleted = state.mappings.run(move |store| store.delete(&key)).await?;

    if !deleted {
        tracing::debug!("No mapping to delete for session {}", short_id(&session_key));
    }
    Ok(Json(DeleteResponse { deleted }))
}
