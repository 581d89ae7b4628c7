//! Jobs and job specifications.

use crate::cache::SharedValueCache;
use calcgrid_compile::{CompileError, FunctionInvoker, InvocationError};
use calcgrid_core::{
    ComputedValue, FunctionId, JobId, NodeId, ProcessId, Timestamp, ValueId, WorkerId,
};
use calcgrid_plan::{CacheVisibility, ExecutionColour, Fragment, FragmentId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Wire description of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpecification {
    /// Unique, monotonically increasing id
    pub job_id: JobId,
    /// Process that owns the job
    pub process_id: ProcessId,
    /// Name of the view configuration being executed
    pub configuration: String,
    /// When the specification was created
    pub created_at: Timestamp,
}

/// Hands out job specifications for one process
#[derive(Debug)]
pub struct JobSpecificationFactory {
    process: ProcessId,
    configuration: String,
    next: AtomicU64,
}

impl JobSpecificationFactory {
    /// Create a new factory
    #[must_use]
    pub fn new(process: ProcessId, configuration: impl Into<String>) -> Self {
        Self {
            process,
            configuration: configuration.into(),
            next: AtomicU64::new(1),
        }
    }

    /// Specification for a job executing `fragment`
    pub fn create(&self, fragment: &Fragment) -> JobSpecification {
        let job_id = JobId::from_raw(self.next.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(job = %job_id, fragment = %fragment.id(), "created job specification");
        JobSpecification {
            job_id,
            process_id: self.process,
            configuration: self.configuration.clone(),
            created_at: Timestamp::now(),
        }
    }

    /// Owning process
    #[must_use]
    pub fn process(&self) -> ProcessId {
        self.process
    }
}

/// One node invocation inside a job
#[derive(Clone)]
pub struct JobItem {
    /// Node being evaluated
    pub node: NodeId,
    /// Function the node invokes
    pub function: FunctionId,
    /// Compiled form
    pub invoker: Arc<dyn FunctionInvoker>,
    /// Consumed values
    pub inputs: Vec<ValueId>,
    /// Produced values
    pub outputs: Vec<ValueId>,
}

impl std::fmt::Debug for JobItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobItem")
            .field("node", &self.node)
            .field("function", &self.function)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Everything a backend needs to execute one fragment
///
/// Built once per dispatch and never mutated.
#[derive(Debug, Clone)]
pub struct Job {
    /// Wire specification
    pub spec: JobSpecification,
    /// Fragment being executed
    pub fragment: FragmentId,
    /// Execution lane, when colouring is enabled
    pub colour: Option<ExecutionColour>,
    /// Items in execution order
    pub items: Vec<JobItem>,
    /// Where each produced value is cached
    pub visibility: CacheVisibility,
    /// Fragments dispatched from this job's completion
    pub tails: Vec<FragmentId>,
    /// Valuation instant
    pub at: Timestamp,
    /// Shared value cache of the execution request
    pub values: Arc<SharedValueCache>,
}

impl Job {
    /// Job id
    #[must_use]
    pub fn id(&self) -> JobId {
        self.spec.job_id
    }
}

/// What a successful job reports back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Job that produced the output
    pub job_id: JobId,
    /// Fragment executed
    pub fragment: FragmentId,
    /// Values published to the shared cache
    pub shared_values: Vec<ComputedValue>,
    /// Items evaluated
    pub items_executed: usize,
}

/// Why a job did not produce output
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    /// A node of the fragment did not compile
    #[error("node {node} did not compile: {error}")]
    Compilation {
        /// Failing node
        node: NodeId,
        /// Compiler error
        error: CompileError,
    },

    /// A function invocation failed
    #[error("node {node} failed: {error}")]
    Invocation {
        /// Failing node
        node: NodeId,
        /// Invocation error
        error: InvocationError,
    },

    /// A function did not produce a value it declares
    #[error("node {node} did not produce {value}")]
    MissingOutput {
        /// Failing node
        node: NodeId,
        /// Missing value
        value: ValueId,
    },

    /// The job was cancelled before it finished
    #[error("job cancelled")]
    Cancelled,

    /// The backend gave up waiting for the job
    #[error("job timed out after {after_ms}ms")]
    Timeout {
        /// Elapsed milliseconds
        after_ms: u64,
    },

    /// The backend could not deliver the job or its result
    #[error("transport error: {0}")]
    Transport(String),

    /// A remote worker reported a failure
    #[error("worker {worker} failed the job: {reason}")]
    Remote {
        /// Reporting worker
        worker: WorkerId,
        /// Failure reported by the worker
        reason: String,
    },

    /// Planning state was inconsistent
    #[error("internal error: {0}")]
    Internal(String),
}
