//! API Module
//!
//! HTTP boundary of the compile service. The handlers here are thin
//! adapters: they validate and decode wire payloads, then drive the job
//! registry and worker pool.

pub mod compile;
pub mod error;
pub mod health;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

use crate::pool::WorkerPool;
use crate::registry::JobRegistry;
use crate::workspace::WorkspaceManager;

/// Shared handler state, assembled by the composition root
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub pool: Arc<WorkerPool>,
    pub workspaces: WorkspaceManager,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/compile/sync", post(compile::compile_sync))
        .route("/compile/async", post(compile::compile_async))
        .route("/job/{id}", get(compile::get_job))
        .route("/job/{id}", delete(compile::delete_job))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
