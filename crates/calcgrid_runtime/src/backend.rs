//! Dispatch backend seam.
//!
//! A backend accepts a [`Job`] and a [`JobResultReceiver`], returns a
//! [`Cancelable`] handle immediately, and later calls the receiver exactly
//! once. Receivers may be called on any thread, including synchronously
//! from inside `dispatch`.

use crate::job::{Job, JobFailure, JobOutput};
use calcgrid_plan::FragmentId;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Best-effort cancellation of a dispatched job
pub trait Cancelable: Send + Sync {
    /// Request cancellation; returns whether it took effect
    fn cancel(&self) -> bool;
}

/// Executes jobs somewhere
pub trait DispatchBackend: Send + Sync {
    /// Start a job and return without waiting for it
    fn dispatch(&self, job: Job, receiver: JobResultReceiver) -> Box<dyn Cancelable>;
}

type Callback = Box<dyn FnOnce(Result<JobOutput, JobFailure>) + Send>;

/// One-shot completion callback for a dispatched job
pub struct JobResultReceiver {
    callback: Callback,
}

impl JobResultReceiver {
    /// Wrap a callback
    pub fn new(callback: impl FnOnce(Result<JobOutput, JobFailure>) + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Deliver the job result
    pub fn complete(self, result: Result<JobOutput, JobFailure>) {
        (self.callback)(result);
    }
}

impl std::fmt::Debug for JobResultReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobResultReceiver").finish_non_exhaustive()
    }
}

/// Cancellation handle backed by a [`CancellationToken`]
///
/// Backends hand the token to the running job and return the handle to the
/// caller. Once the job calls [`finish`](Self::finish), cancelling is a
/// no-op that reports `false`.
#[derive(Debug, Clone, Default)]
pub struct TokenHandle {
    token: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl TokenHandle {
    /// Create a new handle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observed by the running job
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Mark the job finished
    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Cancelable for TokenHandle {
    fn cancel(&self) -> bool {
        if self.finished.load(Ordering::SeqCst) || self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NullMode {
    Immediate,
    Never,
}

/// Backend that does no work
///
/// `immediate()` reports success synchronously with no values.
/// `never()` keeps every job pending until a test completes it through
/// [`take_pending`](Self::take_pending).
pub struct NullBackend {
    mode: NullMode,
    dispatched: Mutex<Vec<FragmentId>>,
    pending: Mutex<Vec<(Job, JobResultReceiver, TokenHandle)>>,
    cancelled: Arc<AtomicUsize>,
}

impl NullBackend {
    /// Succeed every job synchronously
    #[must_use]
    pub fn immediate() -> Self {
        Self::with_mode(NullMode::Immediate)
    }

    /// Never complete a job on its own
    #[must_use]
    pub fn never() -> Self {
        Self::with_mode(NullMode::Never)
    }

    fn with_mode(mode: NullMode) -> Self {
        Self {
            mode,
            dispatched: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fragments dispatched so far, in dispatch order
    #[must_use]
    pub fn dispatched(&self) -> Vec<FragmentId> {
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return every job still pending
    pub fn take_pending(&self) -> Vec<(Job, JobResultReceiver)> {
        let pending = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        pending
            .into_iter()
            .map(|(job, receiver, handle)| {
                handle.finish();
                (job, receiver)
            })
            .collect()
    }

    /// Number of jobs still pending
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of handles cancelled
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct CountingHandle {
    inner: TokenHandle,
    count: Arc<AtomicUsize>,
}

impl Cancelable for CountingHandle {
    fn cancel(&self) -> bool {
        let took = self.inner.cancel();
        if took {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        took
    }
}

impl DispatchBackend for NullBackend {
    fn dispatch(&self, job: Job, receiver: JobResultReceiver) -> Box<dyn Cancelable> {
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job.fragment);

        let handle = TokenHandle::new();
        match self.mode {
            NullMode::Immediate => {
                handle.finish();
                receiver.complete(Ok(JobOutput {
                    job_id: job.id(),
                    fragment: job.fragment,
                    shared_values: Vec::new(),
                    items_executed: 0,
                }));
            }
            NullMode::Never => {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((job, receiver, handle.clone()));
            }
        }

        Box::new(CountingHandle {
            inner: handle,
            count: Arc::clone(&self.cancelled),
        })
    }
}
