//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One tracked compilation request and its lifecycle state.
///
/// Owned by the job registry; every other component mutates it through the
/// registry, never through a private copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    /// Percentage estimate, monotonically non-decreasing while running.
    pub progress: f32,
    /// Set exactly once, on the transition into a terminal status.
    pub result: Option<CompileResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a fresh pending job with a random id.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            progress: 0.0,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

/// Job lifecycle status
///
/// Valid transitions: `Pending → Running → {Completed, Failed}`. A job never
/// skips `Running` and never leaves a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

/// Terminal outcome of one build pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileResult {
    pub success: bool,
    /// Compiled artifact bytes, present iff `success`.
    pub artifact: Option<Vec<u8>>,
    /// Concatenated diagnostic output from every pass that ran.
    pub log: String,
    /// Human-readable failure summary, present iff not `success`.
    pub error: Option<String>,
    /// Machine-readable failure classification, present iff not `success`.
    pub failure: Option<FailureKind>,
}

impl CompileResult {
    pub fn succeeded(artifact: Vec<u8>, log: String) -> Self {
        Self {
            success: true,
            artifact: Some(artifact),
            log,
            error: None,
            failure: None,
        }
    }

    pub fn failed(failure: FailureKind, error: impl Into<String>, log: String) -> Self {
        Self {
            success: false,
            artifact: None,
            log,
            error: Some(error.into()),
            failure: Some(failure),
        }
    }
}

/// Classification of a failed compile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A pass exceeded its execution budget.
    Timeout,
    /// The compiler log contained a fatal-error marker.
    CompilerFatal,
    /// All passes ran but no output artifact was produced.
    ArtifactMissing,
    /// Workspace staging or cleanup hit a disk error.
    IoFailure,
    /// Unexpected orchestration fault caught at the pool-slot boundary.
    InternalFault,
}
