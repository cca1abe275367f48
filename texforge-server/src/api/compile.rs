//! Compile API Handlers
//!
//! HTTP endpoints for submitting compiles and managing tracked jobs.

use axum::{
    Json,
    extract::{Path, State},
};
use uuid::Uuid;

use texforge_core::domain::job::JobStatus;
use texforge_core::dto::compile::{
    AsyncSubmitResponse, CompileRequest, CompileResponse, JobStatusResponse,
};

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::pool::{StageInputs, SubmitError};
use crate::workspace::{StageError, WorkspaceManager};

/// Validates and decodes a request into stage inputs, before any job or
/// workspace exists. Bad names and undecodable payloads are rejected here,
/// at submission time.
fn prepare_inputs(job_id: Uuid, req: &CompileRequest) -> ApiResult<StageInputs> {
    let dependencies = req
        .decode_dependencies()
        .map_err(|err| ApiError::BadRequest(format!("dependency '{}' is not valid base64", err.filename)))?;

    WorkspaceManager::validate_request(
        &req.output_name,
        dependencies.keys().map(String::as_str),
    )
    .map_err(|err| match err {
        StageError::InvalidName(msg) => ApiError::BadRequest(msg),
        StageError::Io(err) => ApiError::InternalError(err.to_string()),
    })?;

    Ok(StageInputs {
        job_id,
        tex_content: req.tex_content.clone(),
        output_name: req.output_name.clone(),
        dependencies,
    })
}

/// POST /compile/sync
/// Compile inline and return the artifact or diagnostics directly. No job
/// survives the call.
pub async fn compile_sync(
    State(state): State<AppState>,
    Json(req): Json<CompileRequest>,
) -> ApiResult<Json<CompileResponse>> {
    tracing::info!("Sync compile request: {}", req.output_name);

    let inputs = prepare_inputs(Uuid::new_v4(), &req)?;
    let result = state.pool.run_sync(inputs).await;

    tracing::info!(
        "Sync compile finished: {} (success: {})",
        req.output_name,
        result.success
    );
    Ok(Json(CompileResponse::from(&result)))
}

/// POST /compile/async
/// Create a tracked job and enqueue it; returns the job id immediately.
pub async fn compile_async(
    State(state): State<AppState>,
    Json(req): Json<CompileRequest>,
) -> ApiResult<Json<AsyncSubmitResponse>> {
    tracing::info!("Async compile request: {}", req.output_name);

    // Validate before the job exists so rejections leave no trace.
    let probe = prepare_inputs(Uuid::new_v4(), &req)?;

    let job = state.registry.create();
    let inputs = StageInputs {
        job_id: job.id,
        ..probe
    };

    if let Err(SubmitError::PoolSaturated) = state.pool.submit_async(inputs) {
        state.registry.remove(job.id);
        return Err(ApiError::Saturated(
            "compile queue is full, retry later".to_string(),
        ));
    }

    tracing::info!("Async compile job accepted: {}", job.id);
    Ok(Json(AsyncSubmitResponse::accepted(job.id)))
}

/// GET /job/{id}
/// Current status, progress, and (once terminal) result of a job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobStatusResponse>> {
    tracing::debug!("Job status query: {}", id);

    let job = state
        .registry
        .get(id)
        .ok_or_else(|| ApiError::NotFound(format!("Job {id} not found")))?;

    Ok(Json(JobStatusResponse::from(&job)))
}

/// DELETE /job/{id}
/// Discard a job's record and reclaim its workspace.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let (job, workspace) = state
        .registry
        .remove(id)
        .ok_or_else(|| ApiError::NotFound(format!("Job {id} not found")))?;

    // A running job's slot still owns the workspace and will destroy it
    // when the pipeline returns; only reclaim it for settled jobs.
    if job.status != JobStatus::Running {
        if let Some(path) = workspace {
            state.workspaces.destroy(&path).await;
        }
    }

    tracing::info!("Job deleted: {}", id);
    Ok(Json(serde_json::json!({ "deleted": id })))
}
