use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::services::permission::PermissionState;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/permission", get(get_permission).post(request_permission))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub state: PermissionState,
    /// Whether a desktop notification platform exists at all.
    pub available: bool,
}

async fn get_permission(State(state): State<Arc<AppState>>) -> Json<PermissionResponse> {
    Json(PermissionResponse {
        state: state.gateway.state(),
        available: state.gateway.is_available(),
    })
}

/// User-initiated permission prompt.
async fn request_permission(State(state): State<Arc<AppState>>) -> Json<PermissionResponse> {
    let permission = state.gateway.prompt().await;
    Json(PermissionResponse {
        state: permission,
        available: state.gateway.is_available(),
    })
}
