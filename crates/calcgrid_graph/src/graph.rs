//! The dependency graph.
//!
//! A `Graph` is built once by [`GraphBuilder`](crate::GraphBuilder) and is
//! read-only afterwards. Every collection is ordered so that iteration is
//! deterministic.

use calcgrid_core::{FunctionId, NodeId, ValueId, ValueRequirement};
use indexmap::{IndexMap, IndexSet};
use std::collections::{BTreeMap, BTreeSet};

/// A single calculation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub(crate) id: NodeId,
    pub(crate) function: FunctionId,
    pub(crate) inputs: IndexSet<ValueId>,
    pub(crate) outputs: IndexSet<ValueId>,
    pub(crate) input_nodes: BTreeSet<NodeId>,
    pub(crate) dependent_nodes: BTreeSet<NodeId>,
}

impl GraphNode {
    /// Node id
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Function this node invokes
    #[must_use]
    pub fn function(&self) -> &FunctionId {
        &self.function
    }

    /// Values consumed, in declaration order
    #[must_use]
    pub fn inputs(&self) -> &IndexSet<ValueId> {
        &self.inputs
    }

    /// Values produced, in declaration order
    #[must_use]
    pub fn outputs(&self) -> &IndexSet<ValueId> {
        &self.outputs
    }

    /// Nodes producing this node's inputs
    #[must_use]
    pub fn input_nodes(&self) -> &BTreeSet<NodeId> {
        &self.input_nodes
    }

    /// Nodes consuming this node's outputs
    #[must_use]
    pub fn dependent_nodes(&self) -> &BTreeSet<NodeId> {
        &self.dependent_nodes
    }
}

/// A validated directed acyclic graph of calculation steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph {
    pub(crate) name: String,
    pub(crate) nodes: Vec<GraphNode>,
    pub(crate) root_inputs: BTreeSet<ValueId>,
    pub(crate) terminal_outputs: IndexMap<ValueRequirement, ValueId>,
    pub(crate) terminal_values: BTreeSet<ValueId>,
    pub(crate) producers: BTreeMap<ValueId, NodeId>,
    pub(crate) consumers: BTreeMap<ValueId, BTreeSet<NodeId>>,
    pub(crate) order: Vec<NodeId>,
}

impl Graph {
    /// Graph label
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get node by id
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(id.index())
    }

    /// All nodes in insertion order
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Node ids in insertion order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|n| n.id)
    }

    /// Get total node count
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if graph is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Values supplied from outside the graph
    #[must_use]
    pub fn root_inputs(&self) -> &BTreeSet<ValueId> {
        &self.root_inputs
    }

    /// Check whether a value is supplied from outside the graph
    #[must_use]
    pub fn is_root_input(&self, value: &ValueId) -> bool {
        self.root_inputs.contains(value)
    }

    /// Requirement to value mapping for externally requested results
    #[must_use]
    pub fn terminal_outputs(&self) -> &IndexMap<ValueRequirement, ValueId> {
        &self.terminal_outputs
    }

    /// Check whether a value satisfies some external requirement
    #[must_use]
    pub fn is_terminal(&self, value: &ValueId) -> bool {
        self.terminal_values.contains(value)
    }

    /// Node producing a value, `None` for root inputs
    #[must_use]
    pub fn producer_of(&self, value: &ValueId) -> Option<NodeId> {
        self.producers.get(value).copied()
    }

    /// Nodes consuming a value, lowest id first
    pub fn consumers_of(&self, value: &ValueId) -> impl Iterator<Item = NodeId> + '_ {
        self.consumers.get(value).into_iter().flatten().copied()
    }

    /// Nodes that depend on the given node
    #[must_use]
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id)
            .map(|n| n.dependent_nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Nodes that the given node depends on
    #[must_use]
    pub fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id)
            .map(|n| n.input_nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Topological order, lowest id first among ready nodes
    #[must_use]
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Distinct functions referenced by the graph
    #[must_use]
    pub fn functions(&self) -> BTreeSet<&FunctionId> {
        self.nodes.iter().map(|n| &n.function).collect()
    }
}
