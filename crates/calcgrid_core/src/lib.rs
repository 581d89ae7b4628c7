//! calcgrid core types
//!
//! Identifiers, value names, and time shared by every calcgrid crate.
//! This crate performs no I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;
pub mod time;
pub mod value;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use id::{JobId, NodeId, ProcessId, WorkerId};
pub use time::{Duration, Timestamp};
pub use value::{ComputedValue, FunctionId, ValueId, ValueRequirement};
