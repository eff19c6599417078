use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let connected = state.hub.connected_count();
    match state.workflow.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "connected_channels": connected })),
        ),
        Err(err) => {
            tracing::error!(error = %err, "participation store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "connected_channels": connected })),
            )
        }
    }
}
