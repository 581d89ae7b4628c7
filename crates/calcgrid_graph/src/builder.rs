//! Incremental graph construction.

use crate::graph::{Graph, GraphNode};
use crate::validate::{self, GraphError};
use calcgrid_core::{FunctionId, NodeId, ValueId, ValueRequirement};
use indexmap::{IndexMap, IndexSet};
use std::collections::{BTreeMap, BTreeSet};

struct PendingNode {
    function: FunctionId,
    inputs: IndexSet<ValueId>,
    outputs: IndexSet<ValueId>,
}

/// Builder for [`Graph`]
///
/// Nodes receive ids in insertion order. Nothing is checked until
/// [`build`](Self::build), which either returns a fully consistent graph
/// or the first structural error found.
pub struct GraphBuilder {
    name: String,
    nodes: Vec<PendingNode>,
    root_inputs: BTreeSet<ValueId>,
    terminal_outputs: IndexMap<ValueRequirement, ValueId>,
}

impl GraphBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            root_inputs: BTreeSet::new(),
            terminal_outputs: IndexMap::new(),
        }
    }

    /// Declare a value supplied from outside the graph
    pub fn declare_root_input(&mut self, value: impl Into<ValueId>) -> &mut Self {
        self.root_inputs.insert(value.into());
        self
    }

    /// Add a node and return its id
    pub fn add_node<I, O>(
        &mut self,
        function: impl Into<FunctionId>,
        inputs: I,
        outputs: O,
    ) -> NodeId
    where
        I: IntoIterator,
        I::Item: Into<ValueId>,
        O: IntoIterator,
        O::Item: Into<ValueId>,
    {
        let id = NodeId::from_index(self.nodes.len()).unwrap_or(NodeId::from_raw(u32::MAX));
        self.nodes.push(PendingNode {
            function: function.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
        });
        id
    }

    /// Map an external requirement onto a value
    pub fn add_terminal_output(
        &mut self,
        requirement: impl Into<ValueRequirement>,
        value: impl Into<ValueId>,
    ) -> &mut Self {
        self.terminal_outputs.insert(requirement.into(), value.into());
        self
    }

    /// Validate and freeze the graph
    ///
    /// # Errors
    ///
    /// Returns the first structural problem found: empty outputs,
    /// duplicate producers, dangling inputs, unknown terminal outputs,
    /// or a cycle.
    pub fn build(self) -> Result<Graph, GraphError> {
        if NodeId::from_index(self.nodes.len()).is_none() {
            return Err(GraphError::TooManyNodes {
                count: self.nodes.len(),
            });
        }

        let mut producers: BTreeMap<ValueId, NodeId> = BTreeMap::new();
        for (index, pending) in self.nodes.iter().enumerate() {
            let id = NodeId::from_raw(index as u32);
            if pending.outputs.is_empty() {
                return Err(GraphError::EmptyOutputs { node: id });
            }
            for value in &pending.outputs {
                if self.root_inputs.contains(value) {
                    return Err(GraphError::ProducedRootInput {
                        value: value.clone(),
                        node: id,
                    });
                }
                if let Some(first) = producers.insert(value.clone(), id) {
                    return Err(GraphError::DuplicateProducer {
                        value: value.clone(),
                        first,
                        second: id,
                    });
                }
            }
        }

        let mut consumers: BTreeMap<ValueId, BTreeSet<NodeId>> = BTreeMap::new();
        let mut nodes: Vec<GraphNode> = Vec::with_capacity(self.nodes.len());
        for (index, pending) in self.nodes.into_iter().enumerate() {
            let id = NodeId::from_raw(index as u32);
            let mut input_nodes = BTreeSet::new();
            for value in &pending.inputs {
                match producers.get(value) {
                    Some(producer) => {
                        input_nodes.insert(*producer);
                    }
                    None if self.root_inputs.contains(value) => {}
                    None => {
                        return Err(GraphError::DanglingInput {
                            node: id,
                            value: value.clone(),
                        });
                    }
                }
                consumers.entry(value.clone()).or_default().insert(id);
            }
            nodes.push(GraphNode {
                id,
                function: pending.function,
                inputs: pending.inputs,
                outputs: pending.outputs,
                input_nodes,
                dependent_nodes: BTreeSet::new(),
            });
        }

        for index in 0..nodes.len() {
            let id = nodes[index].id;
            let deps: Vec<NodeId> = nodes[index].input_nodes.iter().copied().collect();
            for dep in deps {
                nodes[dep.index()].dependent_nodes.insert(id);
            }
        }

        let mut terminal_values = BTreeSet::new();
        for (requirement, value) in &self.terminal_outputs {
            if !producers.contains_key(value) && !self.root_inputs.contains(value) {
                return Err(GraphError::UnknownTerminalOutput {
                    requirement: requirement.clone(),
                    value: value.clone(),
                });
            }
            terminal_values.insert(value.clone());
        }

        validate::check_cycles(&nodes)?;
        let order = validate::topological_order(&nodes);

        tracing::debug!(
            graph = %self.name,
            nodes = nodes.len(),
            terminals = terminal_values.len(),
            "graph built"
        );

        Ok(Graph {
            name: self.name,
            nodes,
            root_inputs: self.root_inputs,
            terminal_outputs: self.terminal_outputs,
            terminal_values,
            producers,
            consumers,
            order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_simple_chain() {
        let mut b = GraphBuilder::new("chain");
        b.declare_root_input("spot");
        let a = b.add_node("scale", ["spot"], ["scaled"]);
        let c = b.add_node("price", ["scaled"], ["pv"]);
        b.add_terminal_output("PV", "pv");
        let graph = b.build().unwrap();

        assert_eq!(graph.name(), "chain");
        assert_eq!(graph.dependents(a), vec![c]);
        assert!(graph.node(a).unwrap().input_nodes().is_empty());
        assert!(graph.is_root_input(&ValueId::from("spot")));
        assert_eq!(graph.consumers_of(&ValueId::from("spot")).collect::<Vec<_>>(), vec![a]);
    }

    #[test]
    fn test_duplicate_producer_rejected() {
        let mut b = GraphBuilder::new("dup");
        b.add_node("f", Vec::<ValueId>::new(), ["x"]);
        b.add_node("g", Vec::<ValueId>::new(), ["x"]);
        assert_eq!(
            b.build().unwrap_err(),
            GraphError::DuplicateProducer {
                value: ValueId::from("x"),
                first: NodeId::from_raw(0),
                second: NodeId::from_raw(1),
            }
        );
    }

    #[test]
    fn test_dangling_input_rejected() {
        let mut b = GraphBuilder::new("dangling");
        b.add_node("f", ["ghost"], ["x"]);
        assert!(matches!(
            b.build().unwrap_err(),
            GraphError::DanglingInput { .. }
        ));
    }

    #[test]
    fn test_produced_root_input_rejected() {
        let mut b = GraphBuilder::new("shadow");
        b.declare_root_input("spot");
        b.add_node("f", Vec::<ValueId>::new(), ["spot"]);
        assert!(matches!(
            b.build().unwrap_err(),
            GraphError::ProducedRootInput { .. }
        ));
    }

    #[test]
    fn test_unknown_terminal_rejected() {
        let mut b = GraphBuilder::new("terminal");
        b.add_node("f", Vec::<ValueId>::new(), ["x"]);
        b.add_terminal_output("PV", "y");
        assert!(matches!(
            b.build().unwrap_err(),
            GraphError::UnknownTerminalOutput { .. }
        ));
    }

    #[test]
    fn test_empty_outputs_rejected() {
        let mut b = GraphBuilder::new("empty");
        b.add_node("f", Vec::<ValueId>::new(), Vec::<ValueId>::new());
        assert_eq!(
            b.build().unwrap_err(),
            GraphError::EmptyOutputs {
                node: NodeId::from_raw(0)
            }
        );
    }

    #[test]
    fn test_root_input_may_be_terminal() {
        let mut b = GraphBuilder::new("passthrough");
        b.declare_root_input("spot");
        b.add_node("f", ["spot"], ["x"]);
        b.add_terminal_output("SPOT", "spot");
        let graph = b.build().unwrap();
        assert!(graph.is_terminal(&ValueId::from("spot")));
    }
}
