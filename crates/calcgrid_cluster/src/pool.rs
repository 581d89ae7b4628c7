//! Worker pool dispatch backend.
//!
//! Jobs with an execution colour always go to the same worker
//! (`colour % workers`), so a lane's fragments run where the lane's earlier
//! fragments ran. Uncoloured jobs are spread round-robin. The pool owns the
//! timeout policy: a request that outlives its client's deadline fails
//! with `JobFailure::Timeout`.

use crate::remote::{LoopbackTransport, RemoteClient, RemoteRequest, TransportError};
use crate::worker::{Worker, WorkerConfig, WorkerStats};
use calcgrid_runtime::{Cancelable, DispatchBackend, Job, JobFailure, JobResultReceiver, TokenHandle};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of workers
    pub workers: usize,
    /// Concurrent jobs per worker
    pub max_concurrent: usize,
    /// Per-request timeout in milliseconds
    pub execution_timeout_ms: u64,
    /// Simulated one-way network delay in milliseconds
    pub latency_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_concurrent: 10,
            execution_timeout_ms: 30_000,
            latency_ms: 0,
        }
    }
}

impl PoolConfig {
    /// Create a config with `workers` workers
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Set the per-request timeout
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout_ms: u64) -> Self {
        self.execution_timeout_ms = timeout_ms;
        self
    }

    /// Check parameter consistency
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a zero worker count, concurrency or
    /// timeout.
    pub fn validate(&self) -> Result<(), PoolError> {
        let zero = [
            ("workers", self.workers == 0),
            ("max_concurrent", self.max_concurrent == 0),
            ("execution_timeout_ms", self.execution_timeout_ms == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(PoolError::InvalidConfig {
                field: *field,
                reason: "must be at least 1".to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Configuration of the `index`th worker
    #[must_use]
    pub fn worker_config(&self, index: usize) -> WorkerConfig {
        WorkerConfig::new(format!("worker-{index}"))
            .with_max_concurrent(self.max_concurrent)
            .with_execution_timeout(self.execution_timeout_ms)
    }
}

/// Pool errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Inconsistent configuration
    #[error("invalid {field}: {reason}")]
    InvalidConfig {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// The pool has no workers
    #[error("pool has no workers")]
    NoWorkers,

    /// No tokio runtime to run requests on
    #[error("no runtime: {0}")]
    Runtime(String),
}

/// Dispatch backend spreading jobs over remote workers
pub struct WorkerPool {
    clients: Vec<RemoteClient>,
    workers: Vec<Arc<Worker>>,
    runtime: Handle,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Start `config.workers` in-process workers on the current runtime
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an invalid configuration and `Runtime`
    /// outside a tokio runtime.
    pub fn new(config: &PoolConfig) -> Result<Self, PoolError> {
        let runtime = Handle::try_current().map_err(|e| PoolError::Runtime(e.to_string()))?;
        Self::with_runtime(config, runtime)
    }

    /// Start in-process workers on `runtime`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an invalid configuration.
    pub fn with_runtime(config: &PoolConfig, runtime: Handle) -> Result<Self, PoolError> {
        config.validate()?;
        let latency = Duration::from_millis(config.latency_ms);

        let workers: Vec<Arc<Worker>> = (0..config.workers)
            .map(|i| Arc::new(Worker::new(config.worker_config(i))))
            .collect();
        let clients = workers
            .iter()
            .map(|worker| {
                let transport = LoopbackTransport::new(Arc::clone(worker)).with_latency(latency);
                RemoteClient::new(Arc::new(transport)).with_timeout(config.execution_timeout_ms)
            })
            .collect();

        tracing::info!(workers = config.workers, max_concurrent = config.max_concurrent, "worker pool started");
        Ok(Self {
            clients,
            workers,
            runtime,
            next: AtomicUsize::new(0),
        })
    }

    /// Build a pool over existing client connections
    ///
    /// # Errors
    ///
    /// Returns `NoWorkers` if `clients` is empty.
    pub fn from_clients(clients: Vec<RemoteClient>, runtime: Handle) -> Result<Self, PoolError> {
        if clients.is_empty() {
            return Err(PoolError::NoWorkers);
        }
        Ok(Self {
            clients,
            workers: Vec::new(),
            runtime,
            next: AtomicUsize::new(0),
        })
    }

    /// Number of worker connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Check if the pool has no connections
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Workers started by the pool itself
    #[must_use]
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Statistics of every local worker
    pub async fn stats(&self) -> Vec<WorkerStats> {
        join_all(self.workers.iter().map(|worker| worker.stats())).await
    }

    /// Shut down every local worker
    pub async fn shutdown(&self) {
        join_all(self.workers.iter().map(|worker| worker.shutdown())).await;
    }

    fn route(&self, job: &Job) -> usize {
        let n = self.clients.len().max(1);
        match job.colour {
            Some(colour) => colour.as_u32() as usize % n,
            None => self.next.fetch_add(1, Ordering::Relaxed) % n,
        }
    }
}

impl DispatchBackend for WorkerPool {
    fn dispatch(&self, job: Job, receiver: JobResultReceiver) -> Box<dyn Cancelable> {
        let handle = TokenHandle::new();

        let request = RemoteRequest::for_job(&job);
        let client = self.clients.get(self.route(&job)).cloned();
        let (request, client) = match (request, client) {
            (Ok(request), Some(client)) => (request, client),
            (Err(err), _) => {
                handle.finish();
                receiver.complete(Err(JobFailure::Transport(err.to_string())));
                return Box::new(handle);
            }
            (_, None) => {
                handle.finish();
                receiver.complete(Err(JobFailure::Transport(PoolError::NoWorkers.to_string())));
                return Box::new(handle);
            }
        };

        tracing::debug!(job = %job.id(), fragment = %job.fragment, worker = %client.worker(), "sending job");
        let finished = handle.clone();
        let (job_id, fragment) = (job.id(), job.fragment);
        self.runtime.spawn(async move {
            let token = finished.token();
            let outcome = tokio::select! {
                () = token.cancelled() => Err(JobFailure::Cancelled),
                sent = client.send(request, job, token.clone()) => match sent {
                    Ok(response) => response.into_output(job_id, fragment),
                    Err(TransportError::Timeout(after_ms)) => Err(JobFailure::Timeout { after_ms }),
                    Err(err) => Err(JobFailure::Transport(err.to_string())),
                },
            };
            finished.finish();
            receiver.complete(outcome);
        });

        Box::new(handle)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("clients", &self.clients)
            .finish_non_exhaustive()
    }
}
