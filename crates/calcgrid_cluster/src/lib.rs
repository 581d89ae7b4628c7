//! calcgrid cluster
//!
//! Remote worker-pool dispatch backend. Jobs travel to workers as
//! [`RemoteRequest`] envelopes; the pool routes each execution lane to one
//! worker and applies the request timeout.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod pool;
pub mod remote;
pub mod worker;

pub use pool::{PoolConfig, PoolError, WorkerPool};
pub use remote::{LoopbackTransport, RemoteClient, RemoteRequest, RemoteResponse, Transport, TransportError};
pub use worker::{Worker, WorkerConfig, WorkerError, WorkerState, WorkerStats};
