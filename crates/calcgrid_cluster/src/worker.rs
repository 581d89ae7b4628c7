//! Worker node for remote execution.

use crate::remote::{RemoteRequest, RemoteResponse};
use calcgrid_core::WorkerId;
use calcgrid_runtime::{Job, JobExecutor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker ID
    pub worker_id: WorkerId,
    /// Human readable name
    pub name: String,
    /// Maximum concurrent executions
    pub max_concurrent: usize,
    /// Execution timeout in milliseconds
    pub execution_timeout_ms: u64,
}

impl WorkerConfig {
    /// Create a new worker config
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            worker_id: WorkerId::new(),
            name: name.into(),
            max_concurrent: 10,
            execution_timeout_ms: 30_000,
        }
    }

    /// Set max concurrent executions
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set execution timeout
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout_ms: u64) -> Self {
        self.execution_timeout_ms = timeout_ms;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("worker")
    }
}

/// Worker errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// Execution could not be started or joined
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The request does not describe the attached job
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The worker is draining or shut down
    #[error("worker not accepting jobs ({0:?})")]
    NotAccepting(WorkerState),

    /// Shutdown
    #[error("worker shutting down")]
    ShuttingDown,
}

/// Worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Accepting jobs
    Active,
    /// Finishing current jobs, refusing new ones
    Draining,
    /// Stopped
    Shutdown,
}

/// Worker statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Worker ID
    pub worker_id: WorkerId,
    /// Worker name
    pub name: String,
    /// Current state
    pub state: WorkerState,
    /// Jobs running now
    pub active_jobs: usize,
    /// Jobs that produced output
    pub completed_jobs: u64,
    /// Jobs that reported a failure
    pub failed_jobs: u64,
    /// Concurrency bound
    pub max_concurrent: usize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Worker node
///
/// Runs at most `max_concurrent` jobs at once; further requests wait for a
/// slot.
pub struct Worker {
    config: WorkerConfig,
    state: RwLock<WorkerState>,
    permits: Arc<Semaphore>,
    executor: JobExecutor,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Worker {
    /// Create a new worker
    #[must_use]
    pub fn new(config: WorkerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            state: RwLock::new(WorkerState::Active),
            permits,
            executor: JobExecutor::new(),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Get the worker's ID
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.config.worker_id
    }

    /// Get the worker's name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get the worker's configuration
    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get the worker's state
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Execute a job described by `request`
    ///
    /// Job failures are reported in the response; errors are reserved for
    /// requests the worker could not run at all.
    ///
    /// # Errors
    ///
    /// Returns `NotAccepting` unless the worker is active, `InvalidRequest`
    /// if the envelope does not match the job, and `ShuttingDown` if the
    /// worker stopped while the request waited for a slot.
    pub async fn execute(
        &self,
        request: RemoteRequest,
        job: Job,
        cancel: CancellationToken,
    ) -> Result<RemoteResponse, WorkerError> {
        let state = self.state().await;
        if state != WorkerState::Active {
            return Err(WorkerError::NotAccepting(state));
        }

        let spec = request
            .specification()
            .map_err(|e| WorkerError::InvalidRequest(e.to_string()))?;
        if spec.job_id != job.id() || request.fragment != job.fragment {
            return Err(WorkerError::InvalidRequest(format!(
                "envelope for {} does not match {}",
                spec.job_id,
                job.id()
            )));
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| WorkerError::ShuttingDown)?;
        let _active = ActiveGuard::enter(&self.active);

        tracing::debug!(worker = %self.config.name, job = %job.id(), fragment = %job.fragment, "executing job");
        let executor = self.executor;
        let result = tokio::task::spawn_blocking(move || executor.run(&job, &cancel))
            .await
            .map_err(|e| WorkerError::ExecutionFailed(e.to_string()))?;

        Ok(match result {
            Ok(output) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                RemoteResponse::success(request.request_id, self.id(), output)
            }
            Err(failure) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = %self.config.name, %failure, "job failed on worker");
                RemoteResponse::failure(request.request_id, self.id(), failure.to_string())
            }
        })
    }

    /// Get active job count
    #[must_use]
    pub fn active_job_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Get completed job count
    #[must_use]
    pub fn completed_job_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Start draining (stop accepting new jobs)
    pub async fn start_drain(&self) {
        *self.state.write().await = WorkerState::Draining;
    }

    /// Shut the worker down once running jobs finish
    pub async fn shutdown(&self) {
        *self.state.write().await = WorkerState::Shutdown;
        self.permits.close();

        while self.active_job_count() > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
        tracing::info!(worker = %self.config.name, "worker shut down");
    }

    /// Get worker statistics
    pub async fn stats(&self) -> WorkerStats {
        WorkerStats {
            worker_id: self.config.worker_id,
            name: self.config.name.clone(),
            state: self.state().await,
            active_jobs: self.active_job_count(),
            completed_jobs: self.completed.load(Ordering::Relaxed),
            failed_jobs: self.failed.load(Ordering::Relaxed),
            max_concurrent: self.config.max_concurrent,
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("active", &self.active_job_count())
            .finish_non_exhaustive()
    }
}
