//! Backend that runs jobs on the local tokio blocking pool.

use crate::backend::{Cancelable, DispatchBackend, JobResultReceiver, TokenHandle};
use crate::executor::JobExecutor;
use crate::job::{Job, JobFailure};
use tokio::runtime::Handle;

/// Runs each job with [`JobExecutor`] on a blocking thread
#[derive(Debug, Clone)]
pub struct InProcessBackend {
    runtime: Handle,
    executor: JobExecutor,
}

impl InProcessBackend {
    /// Create a backend bound to a runtime
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            executor: JobExecutor::new(),
        }
    }

    /// Create a backend bound to the current runtime
    ///
    /// # Errors
    ///
    /// Returns `Transport` when called outside a tokio runtime.
    pub fn current() -> Result<Self, JobFailure> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| JobFailure::Transport(e.to_string()))
    }
}

impl DispatchBackend for InProcessBackend {
    fn dispatch(&self, job: Job, receiver: JobResultReceiver) -> Box<dyn Cancelable> {
        let handle = TokenHandle::new();
        let finished = handle.clone();

        let executor = self.executor;
        self.runtime.spawn_blocking(move || {
            let result = executor.run(&job, &finished.token());
            finished.finish();
            tracing::trace!(job = %job.id(), ok = result.is_ok(), "in-process job finished");
            receiver.complete(result);
        });

        Box::new(handle)
    }
}
