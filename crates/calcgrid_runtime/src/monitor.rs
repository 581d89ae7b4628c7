//! Execution metrics.
//!
//! Counters are updated from dispatch callbacks on arbitrary threads, so
//! they are plain atomics. [`ExecutionMetrics::snapshot`] copies them into a
//! serializable [`MetricsSnapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one engine
#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    requests: AtomicU64,
    jobs_dispatched: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    items_executed: AtomicU64,
}

impl ExecutionMetrics {
    /// Create zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an execution request
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job handed to the backend
    pub fn record_dispatch(&self) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful job
    pub fn record_completion(&self, items: usize) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.items_executed
            .fetch_add(u64::try_from(items).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Record a failed job
    pub fn record_failure(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cancelled fragment
    pub fn record_cancellation(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            jobs_dispatched: self.jobs_dispatched.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            items_executed: self.items_executed.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.requests,
            &self.jobs_dispatched,
            &self.jobs_completed,
            &self.jobs_failed,
            &self.jobs_cancelled,
            &self.items_executed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`ExecutionMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Execution requests accepted
    pub requests: u64,
    /// Jobs handed to the backend
    pub jobs_dispatched: u64,
    /// Jobs that reported output
    pub jobs_completed: u64,
    /// Jobs that reported a failure
    pub jobs_failed: u64,
    /// Fragments cancelled before completing
    pub jobs_cancelled: u64,
    /// Node invocations reported by completed jobs
    pub items_executed: u64,
}

impl MetricsSnapshot {
    /// Completed share of finished jobs (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let finished = self.jobs_completed + self.jobs_failed;
        if finished == 0 {
            return 1.0;
        }
        self.jobs_completed as f64 / finished as f64
    }

    /// Failed share of finished jobs (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let finished = self.jobs_completed + self.jobs_failed;
        if finished == 0 {
            return 0.0;
        }
        self.jobs_failed as f64 / finished as f64
    }
}
