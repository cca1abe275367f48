//! Job registry
//!
//! The authoritative in-memory map of tracked compile jobs. All status,
//! progress, and result mutations go through this type; the worker pool,
//! expiry sweeper, and API handlers share one registry and never hold
//! private copies of job state.
//!
//! The map sits behind a single mutex. Expected job volumes are small (one
//! entry per in-flight or recently finished compile), so coarse locking is
//! the whole concurrency story; the lock is never held across an await.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use texforge_core::domain::job::{CompileResult, Job, JobStatus};

/// Registry error type
#[derive(Debug)]
pub enum RegistryError {
    NotFound(Uuid),
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
    /// A result may be written exactly once, on the terminal transition.
    ResultAlreadySet(Uuid),
    /// A result must accompany a transition into `completed` or `failed`.
    ResultRequiresTerminal(Uuid),
    /// A transition into `completed` or `failed` must carry the result.
    TerminalRequiresResult(Uuid),
}

/// Atomic partial update of one job
///
/// Fields left `None` are untouched. Status changes are validated against
/// the `pending → running → {completed, failed}` state machine; a result may
/// only accompany a transition into a terminal status.
#[derive(Debug, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f32>,
    pub result: Option<CompileResult>,
}

struct JobEntry {
    job: Job,
    /// Workspace directory, tracked so deletion and sweeping can reclaim it.
    workspace: Option<PathBuf>,
}

/// Thread-safe in-memory job store
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, JobEntry>> {
        // A poisoned lock only means another thread panicked mid-operation;
        // the map itself is still usable.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates a new pending job and returns a snapshot of it.
    pub fn create(&self) -> Job {
        let job = Job::new();
        let snapshot = job.clone();
        self.lock().insert(
            job.id,
            JobEntry {
                job,
                workspace: None,
            },
        );
        tracing::debug!("Job created: {}", snapshot.id);
        snapshot
    }

    /// Returns a snapshot of a job, if it exists.
    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.lock().get(&id).map(|entry| entry.job.clone())
    }

    /// Applies an atomic partial update and returns the new snapshot.
    pub fn update(&self, id: Uuid, update: JobUpdate) -> Result<Job, RegistryError> {
        let mut jobs = self.lock();
        let entry = jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        let job = &mut entry.job;

        if let Some(next) = update.status {
            if !job.status.can_transition_to(next) {
                return Err(RegistryError::InvalidTransition {
                    id,
                    from: job.status,
                    to: next,
                });
            }
            if update.result.is_some() && !next.is_terminal() {
                return Err(RegistryError::InvalidTransition {
                    id,
                    from: job.status,
                    to: next,
                });
            }
            // The result is set exactly once, on the terminal transition;
            // a terminal job with an empty result must not exist.
            if next.is_terminal() && update.result.is_none() {
                return Err(RegistryError::TerminalRequiresResult(id));
            }
        } else if update.result.is_some() {
            return Err(RegistryError::ResultRequiresTerminal(id));
        }

        if update.result.is_some() && job.result.is_some() {
            return Err(RegistryError::ResultAlreadySet(id));
        }

        if let Some(next) = update.status {
            job.status = next;
        }
        if let Some(progress) = update.progress {
            // Progress is monotone while running.
            job.progress = job.progress.max(progress);
        }
        if let Some(result) = update.result {
            job.result = Some(result);
        }
        job.updated_at = Utc::now();

        Ok(job.clone())
    }

    /// Transitions a pending job into `running` at zero progress.
    pub fn mark_running(&self, id: Uuid) -> Result<Job, RegistryError> {
        self.update(
            id,
            JobUpdate {
                status: Some(JobStatus::Running),
                progress: Some(0.0),
                result: None,
            },
        )
    }

    /// Bumps the progress estimate of a running job.
    pub fn set_progress(&self, id: Uuid, progress: f32) -> Result<Job, RegistryError> {
        self.update(
            id,
            JobUpdate {
                progress: Some(progress),
                ..Default::default()
            },
        )
    }

    /// Records the terminal outcome of a job.
    pub fn complete(&self, id: Uuid, result: CompileResult) -> Result<Job, RegistryError> {
        let status = if result.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        self.update(
            id,
            JobUpdate {
                status: Some(status),
                progress: Some(100.0),
                result: Some(result),
            },
        )
    }

    /// Removes a job, returning its final snapshot and workspace path.
    pub fn remove(&self, id: Uuid) -> Option<(Job, Option<PathBuf>)> {
        self.lock()
            .remove(&id)
            .map(|entry| (entry.job, entry.workspace))
    }

    /// Associates a workspace directory with a job.
    pub fn set_workspace(&self, id: Uuid, workspace: Option<PathBuf>) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.workspace = workspace;
        }
    }

    /// Detaches and returns a job's workspace path, if it has one.
    pub fn take_workspace(&self, id: Uuid) -> Option<PathBuf> {
        self.lock().get_mut(&id).and_then(|entry| entry.workspace.take())
    }

    /// Number of jobs that are pending or running.
    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| !entry.job.status.is_terminal())
            .count()
    }

    /// Jobs whose last update is older than the retention window.
    ///
    /// Running jobs are never listed; the sweeper must not reclaim a job
    /// mid-execution. Stuck-pending jobs age out by the same rule as
    /// terminal ones.
    pub fn list_expired(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Vec<(Uuid, Option<PathBuf>)> {
        self.lock()
            .values()
            .filter(|entry| entry.job.status != JobStatus::Running)
            .filter(|entry| now - entry.job.updated_at > retention)
            .map(|entry| (entry.job.id, entry.workspace.clone()))
            .collect()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use texforge_core::domain::job::FailureKind;

    fn success_result() -> CompileResult {
        CompileResult::succeeded(vec![1], "log".to_string())
    }

    #[test]
    fn test_create_and_get() {
        let registry = JobRegistry::new();
        let job = registry.create();
        let fetched = registry.get(job.id).unwrap();
        assert_eq!(fetched.status, JobStatus::Pending);
        assert!(registry.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_full_lifecycle() {
        let registry = JobRegistry::new();
        let job = registry.create();

        let running = registry.mark_running(job.id).unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.updated_at >= job.updated_at);

        let done = registry.complete(job.id, success_result()).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100.0);
        assert!(done.result.is_some());
    }

    #[test]
    fn test_failed_lifecycle() {
        let registry = JobRegistry::new();
        let job = registry.create();
        registry.mark_running(job.id).unwrap();

        let result = CompileResult::failed(FailureKind::Timeout, "timed out", String::new());
        let done = registry.complete(job.id, result).unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.result.unwrap().failure, Some(FailureKind::Timeout));
    }

    #[test]
    fn test_cannot_skip_running() {
        let registry = JobRegistry::new();
        let job = registry.create();
        let err = registry.complete(job.id, success_result()).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[test]
    fn test_terminal_state_is_frozen() {
        let registry = JobRegistry::new();
        let job = registry.create();
        registry.mark_running(job.id).unwrap();
        registry.complete(job.id, success_result()).unwrap();

        assert!(registry.mark_running(job.id).is_err());
        assert!(registry.complete(job.id, success_result()).is_err());

        // Terminal snapshots are stable across repeated reads.
        let first = registry.get(job.id).unwrap();
        let second = registry.get(job.id).unwrap();
        assert_eq!(first.updated_at, second.updated_at);
        assert_eq!(first.progress, second.progress);
    }

    #[test]
    fn test_result_set_at_most_once() {
        let registry = JobRegistry::new();
        let job = registry.create();
        registry.mark_running(job.id).unwrap();

        // Result without a terminal transition is rejected.
        let err = registry
            .update(
                job.id,
                JobUpdate {
                    result: Some(success_result()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::ResultRequiresTerminal(_)));
    }

    #[test]
    fn test_terminal_transition_requires_result() {
        let registry = JobRegistry::new();
        let job = registry.create();
        registry.mark_running(job.id).unwrap();

        // A terminal job with an empty result would give pollers a
        // completed status and nothing to read.
        let err = registry
            .update(
                job.id,
                JobUpdate {
                    status: Some(JobStatus::Completed),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::TerminalRequiresResult(_)));

        let err = registry
            .update(
                job.id,
                JobUpdate {
                    status: Some(JobStatus::Failed),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::TerminalRequiresResult(_)));

        // The rejected updates changed nothing.
        assert_eq!(registry.get(job.id).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn test_progress_is_monotone() {
        let registry = JobRegistry::new();
        let job = registry.create();
        registry.mark_running(job.id).unwrap();

        registry.set_progress(job.id, 30.0).unwrap();
        let job_after = registry.set_progress(job.id, 10.0).unwrap();
        assert_eq!(job_after.progress, 30.0);
    }

    #[test]
    fn test_active_count() {
        let registry = JobRegistry::new();
        let a = registry.create();
        let b = registry.create();
        assert_eq!(registry.active_count(), 2);

        registry.mark_running(a.id).unwrap();
        assert_eq!(registry.active_count(), 2);

        registry.complete(a.id, success_result()).unwrap();
        assert_eq!(registry.active_count(), 1);

        registry.remove(b.id).unwrap();
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_list_expired_skips_running() {
        let registry = JobRegistry::new();
        let stale_pending = registry.create();
        let running = registry.create();
        registry.mark_running(running.id).unwrap();

        let done = registry.create();
        registry.mark_running(done.id).unwrap();
        registry.complete(done.id, success_result()).unwrap();

        let later = Utc::now() + chrono::Duration::hours(25);
        let expired = registry.list_expired(later, chrono::Duration::hours(24));
        let ids: Vec<Uuid> = expired.iter().map(|(id, _)| *id).collect();

        assert!(ids.contains(&stale_pending.id));
        assert!(ids.contains(&done.id));
        assert!(!ids.contains(&running.id));

        // Nothing has aged out yet at the current instant.
        assert!(
            registry
                .list_expired(Utc::now(), chrono::Duration::hours(24))
                .is_empty()
        );
    }

    #[test]
    fn test_remove_returns_workspace() {
        let registry = JobRegistry::new();
        let job = registry.create();
        registry.set_workspace(job.id, Some(PathBuf::from("/tmp/ws")));

        let (removed, workspace) = registry.remove(job.id).unwrap();
        assert_eq!(removed.id, job.id);
        assert_eq!(workspace, Some(PathBuf::from("/tmp/ws")));
        assert!(registry.remove(job.id).is_none());
    }
}
