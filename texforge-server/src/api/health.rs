//! Health Check API Handler

use axum::{Json, extract::State};
use chrono::Utc;

use crate::api::AppState;

/// GET /health
/// Liveness plus basic load information
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "texforge",
        "active_jobs": state.registry.active_count(),
        "capacity": state.pool.capacity(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
