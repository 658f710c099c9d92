// HTTP API module - Model listing and session mapping maintenance
//
// These endpoints sit next to the chat completions route:
// - GET    /v1/models                               configured models
// - GET    /v1/conversation/mappings[?recent=N]     store statistics
// - POST   /v1/conversation/cleanup                 age-based purge
// - DELETE /v1/conversation/mappings/:session_key   explicit deletion
//
// Unlike the chat path, store failures here surface as 500s.

mod mappings;
mod models;

pub use mappings::{cleanup_mappings, delete_mapping, mapping_stats};
pub use models::list_models;

use super::error::GatewayError;
use crate::storage::StoreError;

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        GatewayError::Internal(format!("mapping store error: {e}"))
    }
}
