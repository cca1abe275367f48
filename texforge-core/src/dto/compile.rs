//! Compile request/response DTOs

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{CompileResult, FailureKind, Job, JobStatus};

/// Inbound compile request, shared by the sync and async endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileRequest {
    /// Primary LaTeX source to compile.
    pub tex_content: String,
    /// Caller-chosen base name for the produced artifact.
    #[serde(default = "default_output_name")]
    pub output_name: String,
    /// Auxiliary files keyed by workspace-relative name, base64-encoded.
    #[serde(default)]
    pub dependencies: Option<HashMap<String, String>>,
}

fn default_output_name() -> String {
    "output".to_string()
}

impl CompileRequest {
    /// Decodes the base64 dependency map into raw bytes.
    ///
    /// Any entry that fails to decode rejects the whole request; silently
    /// dropping a dependency would only surface later as a confusing
    /// compiler error.
    pub fn decode_dependencies(&self) -> Result<HashMap<String, Vec<u8>>, DependencyDecodeError> {
        let mut decoded = HashMap::new();
        if let Some(deps) = &self.dependencies {
            for (filename, content) in deps {
                let bytes = BASE64.decode(content).map_err(|source| DependencyDecodeError {
                    filename: filename.clone(),
                    source,
                })?;
                decoded.insert(filename.clone(), bytes);
            }
        }
        Ok(decoded)
    }
}

/// A dependency whose payload was not valid base64
#[derive(Debug)]
pub struct DependencyDecodeError {
    pub filename: String,
    pub source: base64::DecodeError,
}

/// Outcome of a compile, as returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileResponse {
    pub success: bool,
    /// Compiled PDF, base64-encoded, present iff `success`.
    pub pdf_content: Option<String>,
    pub log: String,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
}

impl From<&CompileResult> for CompileResponse {
    fn from(result: &CompileResult) -> Self {
        Self {
            success: result.success,
            pdf_content: result.artifact.as_deref().map(|bytes| BASE64.encode(bytes)),
            log: result.log.clone(),
            error: result.error.clone(),
            error_kind: result.failure,
        }
    }
}

/// Response to an asynchronous submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncSubmitResponse {
    pub success: bool,
    pub job_id: Option<Uuid>,
    pub error: Option<String>,
}

impl AsyncSubmitResponse {
    pub fn accepted(job_id: Uuid) -> Self {
        Self {
            success: true,
            job_id: Some(job_id),
            error: None,
        }
    }
}

/// Snapshot of a tracked job, as returned by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: f32,
    pub result: Option<CompileResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            result: job.result.as_ref().map(CompileResponse::from),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
