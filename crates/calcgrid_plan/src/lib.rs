//! calcgrid execution planning
//!
//! Splits a dependency graph into fragments (groups of nodes executed as
//! one job), orders them leaves-first, assigns execution colours when the
//! concurrency limit is bounded, and decides which produced values stay
//! private to a fragment and which must be shared.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod colour;
pub mod config;
pub mod error;
pub mod fragment;
pub mod partition;
pub mod plan;
pub mod visibility;

pub use colour::ExecutionColour;
pub use config::PartitionConfig;
pub use error::PlanError;
pub use fragment::{Fragment, FragmentId, FragmentTree};
pub use partition::Partitioner;
pub use plan::{ExecutionPlan, FragmentReport, PlanReport};
pub use visibility::{CacheVisibility, Visibility, classify, classify_all};
