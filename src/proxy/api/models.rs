// Models endpoint - Lists models that have an upstream credential

use axum::{extract::State, Json};
use serde::Serialize;

use crate::proxy::GatewayState;

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

/// GET /v1/models
pub async fn list_models(State(state): State<GatewayState>) -> Json<ModelList> {
    let data: Vec<ModelEntry> = state
        .models
        .names()
        .map(|id| ModelEntry {
            id: id.to_string(),
            object: "model",
            created: state.started_at,
            owned_by: "chatbridge",
        })
        .collect();

    tracing::debug!("Listing {} model(s)", data.len());
    Json(ModelList {
        object: "list",
        data,
    })
}
