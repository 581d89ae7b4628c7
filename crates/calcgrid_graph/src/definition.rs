//! Serializable graph definitions.
//!
//! The JSON shape accepted by the command line tool:
//!
//! ```json
//! {
//!   "name": "book",
//!   "root_inputs": ["spot"],
//!   "nodes": [
//!     { "function": "sum", "inputs": ["spot"], "outputs": ["pv"] }
//!   ],
//!   "terminal_outputs": { "PV": "pv" }
//! }
//! ```
//!
//! Node ids are assigned from the position in `nodes`.

use crate::builder::GraphBuilder;
use crate::graph::Graph;
use crate::validate::GraphError;
use calcgrid_core::{FunctionId, ValueId, ValueRequirement};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One node of a [`GraphDefinition`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Function to invoke
    pub function: FunctionId,
    /// Consumed values
    #[serde(default)]
    pub inputs: Vec<ValueId>,
    /// Produced values
    pub outputs: Vec<ValueId>,
}

/// Serializable description of a graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDefinition {
    /// Graph label
    pub name: String,
    /// Externally supplied values
    #[serde(default)]
    pub root_inputs: Vec<ValueId>,
    /// Nodes, in id order
    pub nodes: Vec<NodeDefinition>,
    /// Requirement to value mapping
    #[serde(default)]
    pub terminal_outputs: IndexMap<ValueRequirement, ValueId>,
}

impl GraphDefinition {
    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns `InvalidDefinition` if the text is not a valid definition.
    pub fn from_json(text: &str) -> Result<Self, GraphError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode as pretty-printed JSON
    ///
    /// # Errors
    ///
    /// Returns `InvalidDefinition` if encoding fails.
    pub fn to_json(&self) -> Result<String, GraphError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Build and validate the graph
    ///
    /// # Errors
    ///
    /// Returns any structural error reported by [`GraphBuilder::build`].
    pub fn into_graph(self) -> Result<Graph, GraphError> {
        let mut builder = GraphBuilder::new(self.name);
        for value in self.root_inputs {
            builder.declare_root_input(value);
        }
        for node in self.nodes {
            builder.add_node(node.function, node.inputs, node.outputs);
        }
        for (requirement, value) in self.terminal_outputs {
            builder.add_terminal_output(requirement, value);
        }
        builder.build()
    }
}

impl From<&Graph> for GraphDefinition {
    fn from(graph: &Graph) -> Self {
        Self {
            name: graph.name().to_string(),
            root_inputs: graph.root_inputs().iter().cloned().collect(),
            nodes: graph
                .nodes()
                .iter()
                .map(|n| NodeDefinition {
                    function: n.function().clone(),
                    inputs: n.inputs().iter().cloned().collect(),
                    outputs: n.outputs().iter().cloned().collect(),
                })
                .collect(),
            terminal_outputs: graph.terminal_outputs().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample;

    #[test]
    fn test_parse_definition() {
        let text = r#"{
            "name": "book",
            "root_inputs": ["spot"],
            "nodes": [
                { "function": "sum", "inputs": ["spot"], "outputs": ["pv"] },
                { "function": "seed", "outputs": ["one"] }
            ],
            "terminal_outputs": { "PV": "pv" }
        }"#;
        let graph = GraphDefinition::from_json(text).unwrap().into_graph().unwrap();
        assert_eq!(graph.len(), 2);
        assert!(graph.node(calcgrid_core::NodeId::from_raw(1)).unwrap().inputs().is_empty());
        assert!(graph.is_terminal(&ValueId::from("pv")));
    }

    #[test]
    fn test_malformed_json_is_invalid_definition() {
        let err = GraphDefinition::from_json("{ \"name\": 3 }").unwrap_err();
        assert!(matches!(err, GraphError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_definition_rebuilds_same_graph() {
        let graph = sample::chains_graph();
        let rebuilt = GraphDefinition::from(&graph).into_graph().unwrap();
        assert_eq!(rebuilt, graph);
    }
}
