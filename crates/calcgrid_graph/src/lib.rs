//! calcgrid dependency graph
//!
//! An immutable, arena-backed DAG of calculation steps. Nodes are
//! addressed by [`NodeId`](calcgrid_core::NodeId) and connected through the
//! values they produce and consume.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod definition;
pub mod graph;
pub mod sample;
pub mod validate;

pub use builder::GraphBuilder;
pub use definition::{GraphDefinition, NodeDefinition};
pub use graph::{Graph, GraphNode};
pub use validate::GraphError;
