//! calcgrid runtime
//!
//! Turns an execution plan into jobs, dispatches them leaves-first through
//! a pluggable [`DispatchBackend`], and folds their completion into one
//! cancellable [`RootFuture`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregator;
pub mod backend;
pub mod cache;
pub mod engine;
pub mod executor;
pub mod inprocess;
pub mod job;
pub mod monitor;

pub use aggregator::{ExecutionError, ExecutionResults, FragmentState, RootFuture, RootHandle};
pub use backend::{Cancelable, DispatchBackend, JobResultReceiver, NullBackend, TokenHandle};
pub use cache::{PrivateValueCache, SharedValueCache};
pub use engine::{ConfigError, EngineConfig, ExecutionEngine, ExecutionRequest};
pub use executor::JobExecutor;
pub use inprocess::InProcessBackend;
pub use job::{Job, JobFailure, JobItem, JobOutput, JobSpecification, JobSpecificationFactory};
pub use monitor::{ExecutionMetrics, MetricsSnapshot};
