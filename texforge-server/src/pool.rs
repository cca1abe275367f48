//! Worker pool
//!
//! A fixed-size pool of execution slots that runs build pipelines against
//! staged workspaces. Async submissions go through a bounded queue; a full
//! queue rejects the submission immediately rather than silently delaying
//! the job. Slots write every state change back through the job registry
//! and always tear the workspace down afterward, whatever the outcome.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use texforge_core::domain::job::{CompileResult, FailureKind, JobStatus};

use crate::config::Config;
use crate::pipeline::BuildPipeline;
use crate::registry::JobRegistry;
use crate::workspace::{StageError, WorkspaceManager};

/// Everything a slot needs to stage and run one job
#[derive(Debug)]
pub struct StageInputs {
    pub job_id: Uuid,
    pub tex_content: String,
    pub output_name: String,
    pub dependencies: HashMap<String, Vec<u8>>,
}

/// Submission rejection
#[derive(Debug)]
pub enum SubmitError {
    /// The async queue is full; the caller must retry later.
    PoolSaturated,
}

/// Bounded-concurrency executor for compile jobs
pub struct WorkerPool {
    queue: mpsc::Sender<StageInputs>,
    slots: Arc<Semaphore>,
    capacity: usize,
    registry: Arc<JobRegistry>,
    workspaces: WorkspaceManager,
    pipeline: Arc<BuildPipeline>,
}

impl WorkerPool {
    /// Creates the pool and spawns its dispatcher task.
    pub fn start(
        registry: Arc<JobRegistry>,
        workspaces: WorkspaceManager,
        pipeline: Arc<BuildPipeline>,
        config: &Config,
    ) -> Arc<Self> {
        let (queue, rx) = mpsc::channel(config.queue_capacity);
        let slots = Arc::new(Semaphore::new(config.pool_size));

        let pool = Arc::new(Self {
            queue,
            slots: Arc::clone(&slots),
            capacity: config.pool_size,
            registry,
            workspaces,
            pipeline,
        });

        tokio::spawn(Self::dispatch(Arc::clone(&pool), rx));
        info!(
            "Worker pool started: {} slots, queue depth {}",
            config.pool_size, config.queue_capacity
        );
        pool
    }

    /// Configured maximum concurrent executions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueues an async job; returns immediately.
    ///
    /// The job must already exist in the registry in `pending` state. A full
    /// queue is backpressure: the submission fails and no slot will ever
    /// pick the job up.
    pub fn submit_async(&self, inputs: StageInputs) -> Result<(), SubmitError> {
        self.queue.try_send(inputs).map_err(|err| {
            debug!("Async submission rejected, queue full: {}", err);
            SubmitError::PoolSaturated
        })
    }

    /// Runs a compile inline on a pool slot, blocking the caller for the
    /// whole pipeline. No registry entry is created; the result only lives
    /// in the response.
    pub async fn run_sync(&self, inputs: StageInputs) -> CompileResult {
        // Sync compiles share the concurrency bound with async slots.
        let _permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return CompileResult::failed(
                    FailureKind::InternalFault,
                    "worker pool is shut down",
                    String::new(),
                );
            }
        };

        let workspace = match self
            .workspaces
            .stage(
                inputs.job_id,
                &inputs.tex_content,
                &inputs.output_name,
                &inputs.dependencies,
            )
            .await
        {
            Ok(workspace) => workspace,
            Err(err) => return stage_failure(err),
        };

        let result = self.pipeline.run(&workspace).await;
        self.workspaces.destroy(&workspace.path).await;
        result
    }

    /// Dispatcher: takes the next queued job, waits for a free slot, and
    /// runs it. At most one dequeued job waits on a slot at a time, so the
    /// number of accepted-but-unfinished jobs stays bounded by queue depth
    /// plus pool size.
    async fn dispatch(pool: Arc<Self>, mut rx: mpsc::Receiver<StageInputs>) {
        while let Some(inputs) = rx.recv().await {
            let permit = match pool.slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let _permit = permit;
                let job_id = inputs.job_id;
                let slot = tokio::spawn({
                    let pool = Arc::clone(&pool);
                    async move { pool.execute_slot(inputs).await }
                });
                // A panicked slot must still settle its job and give back
                // its workspace.
                if let Err(err) = slot.await {
                    warn!("Slot task for job {} panicked: {}", job_id, err);
                    pool.reap_panicked_slot(job_id).await;
                }
            });
        }
        debug!("Worker pool dispatcher stopped");
    }

    /// Slot boundary: any orchestration fault below here becomes a `failed`
    /// job instead of propagating, so no job is ever left `running`.
    async fn execute_slot(&self, inputs: StageInputs) {
        let job_id = inputs.job_id;
        if let Err(err) = self.run_job(inputs).await {
            error!("Job {} hit an internal fault: {:#}", job_id, err);
            let result = CompileResult::failed(
                FailureKind::InternalFault,
                format!("internal error: {err:#}"),
                String::new(),
            );
            if let Err(reg_err) = self.registry.complete(job_id, result) {
                warn!(
                    "Could not record internal fault for job {}: {:?}",
                    job_id, reg_err
                );
            }
        }
    }

    /// Last-resort recovery after a slot task panic: destroy whatever
    /// workspace the slot had staged and drive the job to `failed` so it is
    /// never left `running`.
    async fn reap_panicked_slot(&self, job_id: Uuid) {
        if let Some(path) = self.registry.take_workspace(job_id) {
            self.workspaces.destroy(&path).await;
        }

        let Some(job) = self.registry.get(job_id) else {
            return;
        };
        if job.status.is_terminal() {
            return;
        }
        // A panic before the running transition still needs the job moved
        // through it to reach a terminal state.
        if job.status == JobStatus::Pending {
            let _ = self.registry.mark_running(job_id);
        }
        let result = CompileResult::failed(
            FailureKind::InternalFault,
            "internal error: compile task aborted unexpectedly",
            String::new(),
        );
        if let Err(err) = self.registry.complete(job_id, result) {
            warn!(
                "Could not record aborted slot for job {}: {:?}",
                job_id, err
            );
        }
    }

    async fn run_job(&self, inputs: StageInputs) -> anyhow::Result<()> {
        let job_id = inputs.job_id;

        self.registry
            .mark_running(job_id)
            .map_err(|err| anyhow!("cannot start job: {err:?}"))?;
        info!("Job {} running", job_id);

        let workspace = match self
            .workspaces
            .stage(
                job_id,
                &inputs.tex_content,
                &inputs.output_name,
                &inputs.dependencies,
            )
            .await
        {
            Ok(workspace) => workspace,
            Err(err) => {
                // Staging failures are a terminal job result, not a fault.
                self.registry
                    .complete(job_id, stage_failure(err))
                    .map_err(|err| anyhow!("cannot record staging failure: {err:?}"))?;
                return Ok(());
            }
        };

        self.registry
            .set_workspace(job_id, Some(workspace.path.clone()));
        let _ = self.registry.set_progress(job_id, 10.0);

        let result = self.pipeline.run(&workspace).await;
        let _ = self.registry.set_progress(job_id, 90.0);

        let success = result.success;
        let outcome = self.registry.complete(job_id, result);

        // Cleanup happens whatever the outcome, including a job that was
        // deleted while it ran.
        self.workspaces.destroy(&workspace.path).await;
        self.registry.set_workspace(job_id, None);

        match outcome {
            Ok(_) => {
                info!("Job {} finished (success: {})", job_id, success);
                Ok(())
            }
            Err(err) => {
                warn!("Job {} finished but could not be recorded: {:?}", job_id, err);
                Ok(())
            }
        }
    }
}

fn stage_failure(err: StageError) -> CompileResult {
    match err {
        StageError::InvalidName(msg) => CompileResult::failed(
            FailureKind::InternalFault,
            format!("invalid name passed pre-validation: {msg}"),
            String::new(),
        ),
        StageError::Io(err) => CompileResult::failed(
            FailureKind::IoFailure,
            format!("workspace staging failed: {err}"),
            String::new(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::pipeline::{PassError, PassOutput, Toolchain};
    use texforge_core::domain::job::{Job, JobStatus};

    /// Minimal fake: every latex pass writes the PDF after an optional
    /// delay; bibtex is never reached (no .bib dependencies in these tests).
    struct InstantToolchain {
        delay: Duration,
    }

    #[async_trait]
    impl Toolchain for InstantToolchain {
        async fn latex_pass(
            &self,
            workspace: &Path,
            tex_file: &str,
        ) -> Result<PassOutput, PassError> {
            tokio::time::sleep(self.delay).await;
            let stem = tex_file.trim_end_matches(".tex");
            std::fs::write(workspace.join(format!("{stem}.pdf")), b"%PDF fake").unwrap();
            Ok(PassOutput {
                exit_ok: true,
                stdout: "pass ok".to_string(),
                stderr: String::new(),
            })
        }

        async fn bibtex_pass(
            &self,
            _workspace: &Path,
            _output_name: &str,
        ) -> Result<PassOutput, PassError> {
            Ok(PassOutput {
                exit_ok: true,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    struct Harness {
        _scratch: tempfile::TempDir,
        registry: Arc<JobRegistry>,
        workspaces: WorkspaceManager,
        pool: Arc<WorkerPool>,
    }

    fn harness(pool_size: usize, queue_capacity: usize, delay: Duration) -> Harness {
        let scratch = tempfile::tempdir().unwrap();
        let config = Config {
            pool_size,
            queue_capacity,
            scratch_root: scratch.path().to_path_buf(),
            ..Config::default()
        };
        let registry = Arc::new(JobRegistry::new());
        let workspaces = WorkspaceManager::new(config.scratch_root.clone());
        let pipeline = Arc::new(BuildPipeline::new(
            Arc::new(InstantToolchain { delay }),
            &config,
        ));
        let pool = WorkerPool::start(
            Arc::clone(&registry),
            workspaces.clone(),
            pipeline,
            &config,
        );
        Harness {
            _scratch: scratch,
            registry,
            workspaces,
            pool,
        }
    }

    fn inputs(job_id: Uuid) -> StageInputs {
        StageInputs {
            job_id,
            tex_content: "\\documentclass{article}".to_string(),
            output_name: "doc".to_string(),
            dependencies: HashMap::new(),
        }
    }

    async fn wait_terminal(registry: &JobRegistry, id: Uuid) -> Job {
        for _ in 0..200 {
            if let Some(job) = registry.get(id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    /// The slot records the terminal result before removing the workspace,
    /// so give cleanup a moment to land.
    async fn wait_gone(path: &Path) {
        for _ in 0..200 {
            if !path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workspace {} was never destroyed", path.display());
    }

    #[tokio::test]
    async fn test_async_job_runs_to_completion() {
        let h = harness(2, 4, Duration::ZERO);
        let job = h.registry.create();
        h.pool.submit_async(inputs(job.id)).unwrap();

        let done = wait_terminal(&h.registry, job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100.0);
        let result = done.result.unwrap();
        assert!(result.success);
        assert!(result.artifact.is_some());

        // The slot destroyed the workspace after recording the result.
        wait_gone(&h.workspaces.root().join(job.id.to_string())).await;
    }

    #[tokio::test]
    async fn test_full_queue_rejects_submission() {
        let h = harness(1, 1, Duration::from_secs(30));

        // First job occupies the only slot; the second is dequeued and
        // waits for it; the third fills the queue.
        for _ in 0..3 {
            let job = h.registry.create();
            h.pool.submit_async(inputs(job.id)).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let overflow = h.registry.create();
        let err = h.pool.submit_async(inputs(overflow.id)).unwrap_err();
        assert!(matches!(err, SubmitError::PoolSaturated));
    }

    #[tokio::test]
    async fn test_staging_failure_yields_failed_job() {
        let scratch = tempfile::tempdir().unwrap();
        // Point the workspace root at a regular file so staging cannot
        // create the job directory.
        let bogus_root = scratch.path().join("not-a-dir");
        std::fs::write(&bogus_root, b"file").unwrap();

        let config = Config {
            pool_size: 1,
            queue_capacity: 2,
            scratch_root: bogus_root.clone(),
            ..Config::default()
        };
        let registry = Arc::new(JobRegistry::new());
        let pipeline = Arc::new(BuildPipeline::new(
            Arc::new(InstantToolchain {
                delay: Duration::ZERO,
            }),
            &config,
        ));
        let pool = WorkerPool::start(
            Arc::clone(&registry),
            WorkspaceManager::new(bogus_root),
            pipeline,
            &config,
        );

        let job = registry.create();
        pool.submit_async(inputs(job.id)).unwrap();

        let done = wait_terminal(&registry, job.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        let result = done.result.unwrap();
        assert_eq!(result.failure, Some(FailureKind::IoFailure));
    }

    /// Every latex pass times out immediately.
    struct TimeoutToolchain;

    #[async_trait]
    impl Toolchain for TimeoutToolchain {
        async fn latex_pass(
            &self,
            _workspace: &Path,
            _tex_file: &str,
        ) -> Result<PassOutput, PassError> {
            Err(PassError::Timeout(Duration::from_secs(1)))
        }

        async fn bibtex_pass(
            &self,
            _workspace: &Path,
            _output_name: &str,
        ) -> Result<PassOutput, PassError> {
            Err(PassError::Timeout(Duration::from_secs(1)))
        }
    }

    /// Every latex pass dies mid-flight, as an unexpected bug would.
    struct PanickingToolchain;

    #[async_trait]
    impl Toolchain for PanickingToolchain {
        async fn latex_pass(
            &self,
            _workspace: &Path,
            _tex_file: &str,
        ) -> Result<PassOutput, PassError> {
            panic!("toolchain blew up");
        }

        async fn bibtex_pass(
            &self,
            _workspace: &Path,
            _output_name: &str,
        ) -> Result<PassOutput, PassError> {
            panic!("toolchain blew up");
        }
    }

    #[tokio::test]
    async fn test_panicked_slot_settles_its_job() {
        let scratch = tempfile::tempdir().unwrap();
        let config = Config {
            pool_size: 1,
            queue_capacity: 2,
            scratch_root: scratch.path().to_path_buf(),
            ..Config::default()
        };
        let registry = Arc::new(JobRegistry::new());
        let workspaces = WorkspaceManager::new(config.scratch_root.clone());
        let pipeline = Arc::new(BuildPipeline::new(Arc::new(PanickingToolchain), &config));
        let pool = WorkerPool::start(
            Arc::clone(&registry),
            workspaces.clone(),
            pipeline,
            &config,
        );

        let job = registry.create();
        pool.submit_async(inputs(job.id)).unwrap();

        // The panic happens after staging, so the job must be driven to
        // failed and its staged workspace removed.
        let done = wait_terminal(&registry, job.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(
            done.result.unwrap().failure,
            Some(FailureKind::InternalFault)
        );
        wait_gone(&workspaces.root().join(job.id.to_string())).await;

        // The slot permit was released; the pool still takes new work.
        let next = registry.create();
        pool.submit_async(inputs(next.id)).unwrap();
        let done = wait_terminal(&registry, next.id).await;
        assert_eq!(done.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_timed_out_job_still_loses_its_workspace() {
        let scratch = tempfile::tempdir().unwrap();
        let config = Config {
            pool_size: 1,
            queue_capacity: 2,
            scratch_root: scratch.path().to_path_buf(),
            ..Config::default()
        };
        let registry = Arc::new(JobRegistry::new());
        let workspaces = WorkspaceManager::new(config.scratch_root.clone());
        let pipeline = Arc::new(BuildPipeline::new(Arc::new(TimeoutToolchain), &config));
        let pool = WorkerPool::start(
            Arc::clone(&registry),
            workspaces.clone(),
            pipeline,
            &config,
        );

        let job = registry.create();
        pool.submit_async(inputs(job.id)).unwrap();

        let done = wait_terminal(&registry, job.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.result.unwrap().failure, Some(FailureKind::Timeout));
        wait_gone(&workspaces.root().join(job.id.to_string())).await;
    }

    #[tokio::test]
    async fn test_run_sync_leaves_no_registry_entry() {
        let h = harness(2, 4, Duration::ZERO);
        let job_id = Uuid::new_v4();

        let result = h.pool.run_sync(inputs(job_id)).await;
        assert!(result.success);
        assert!(result.artifact.is_some());

        assert!(h.registry.get(job_id).is_none());
        assert_eq!(h.registry.active_count(), 0);
        assert!(!h.workspaces.root().join(job_id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_capacity_reports_pool_size() {
        let h = harness(3, 4, Duration::ZERO);
        assert_eq!(h.pool.capacity(), 3);
    }
}
