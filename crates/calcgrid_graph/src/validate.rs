//! Structural validation for dependency graphs.

use crate::graph::GraphNode;
use calcgrid_core::{NodeId, ValueId, ValueRequirement};
use std::collections::BTreeSet;
use thiserror::Error;

/// Structural error in a graph definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two nodes claim to produce the same value
    #[error("value {value} is produced by both {first} and {second}")]
    DuplicateProducer {
        /// Contested value
        value: ValueId,
        /// Earlier producer
        first: NodeId,
        /// Later producer
        second: NodeId,
    },

    /// A node produces a value that is also declared as a root input
    #[error("value {value} is a root input but is also produced by {node}")]
    ProducedRootInput {
        /// Contested value
        value: ValueId,
        /// Producing node
        node: NodeId,
    },

    /// An input is neither produced by a node nor a declared root input
    #[error("node {node} consumes {value}, which nothing produces")]
    DanglingInput {
        /// Consuming node
        node: NodeId,
        /// Missing value
        value: ValueId,
    },

    /// A terminal output names an unknown value
    #[error("requirement {requirement} maps to unknown value {value}")]
    UnknownTerminalOutput {
        /// External requirement
        requirement: ValueRequirement,
        /// Value it names
        value: ValueId,
    },

    /// A node declares no outputs
    #[error("node {node} produces no values")]
    EmptyOutputs {
        /// Offending node
        node: NodeId,
    },

    /// The graph contains a cycle
    #[error("cycle detected involving nodes {nodes:?}")]
    Cycle {
        /// Nodes on the cycle, in traversal order
        nodes: Vec<NodeId>,
    },

    /// More nodes than the id space allows
    #[error("graph has {count} nodes, more than the id space allows")]
    TooManyNodes {
        /// Attempted node count
        count: usize,
    },

    /// A graph definition could not be decoded
    #[error("invalid graph definition: {message}")]
    InvalidDefinition {
        /// Decoder message
        message: String,
    },
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidDefinition {
            message: err.to_string(),
        }
    }
}

/// Reject cycles with an iterative depth-first search.
///
/// `nodes` must already carry their `input_nodes`.
pub(crate) fn check_cycles(nodes: &[GraphNode]) -> Result<(), GraphError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];

    for start in nodes {
        if marks[start.id.index()] != Mark::Unvisited {
            continue;
        }

        // (node, remaining dependencies to visit)
        let mut stack: Vec<(NodeId, Vec<NodeId>)> = Vec::new();
        marks[start.id.index()] = Mark::OnStack;
        stack.push((start.id, start.input_nodes.iter().rev().copied().collect()));

        while let Some((current, pending)) = stack.last_mut() {
            let current = *current;
            match pending.pop() {
                Some(dep) => match marks[dep.index()] {
                    Mark::OnStack => {
                        let mut cycle: Vec<NodeId> = stack
                            .iter()
                            .map(|(id, _)| *id)
                            .skip_while(|id| *id != dep)
                            .collect();
                        cycle.dedup();
                        return Err(GraphError::Cycle { nodes: cycle });
                    }
                    Mark::Done => {}
                    Mark::Unvisited => {
                        marks[dep.index()] = Mark::OnStack;
                        let deps = nodes[dep.index()].input_nodes.iter().rev().copied().collect();
                        stack.push((dep, deps));
                    }
                },
                None => {
                    marks[current.index()] = Mark::Done;
                    stack.pop();
                }
            }
        }
    }

    Ok(())
}

/// Kahn's algorithm, always releasing the lowest ready id first.
///
/// Only meaningful once [`check_cycles`] has passed.
pub(crate) fn topological_order(nodes: &[GraphNode]) -> Vec<NodeId> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.input_nodes.len()).collect();
    let mut ready: BTreeSet<NodeId> = nodes
        .iter()
        .filter(|n| n.input_nodes.is_empty())
        .map(|n| n.id)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for dependent in &nodes[next.index()].dependent_nodes {
            let degree = &mut in_degree[dependent.index()];
            *degree -= 1;
            if *degree == 0 {
                ready.insert(*dependent);
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GraphBuilder;
    use proptest::prelude::*;

    #[test]
    fn test_two_node_cycle() {
        let mut b = GraphBuilder::new("cycle");
        b.add_node("f", ["b"], ["a"]);
        b.add_node("f", ["a"], ["b"]);
        let err = b.build().unwrap_err();
        match err {
            GraphError::Cycle { nodes } => {
                assert_eq!(nodes.len(), 2);
                assert!(nodes.contains(&NodeId::from_raw(0)));
                assert!(nodes.contains(&NodeId::from_raw(1)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_loop() {
        let mut b = GraphBuilder::new("self");
        b.add_node("f", ["a"], ["a"]);
        assert_eq!(
            b.build().unwrap_err(),
            GraphError::Cycle {
                nodes: vec![NodeId::from_raw(0)]
            }
        );
    }

    #[test]
    fn test_long_chain_does_not_overflow_stack() {
        let mut b = GraphBuilder::new("chain");
        b.declare_root_input("v0");
        for i in 0..50_000 {
            b.add_node("f", [format!("v{i}")], [format!("v{}", i + 1)]);
        }
        let graph = b.build().unwrap();
        assert_eq!(graph.topological_order().len(), 50_000);
    }

    #[test]
    fn test_error_display() {
        let err = GraphError::DanglingInput {
            node: NodeId::from_raw(3),
            value: ValueId::from("spot"),
        };
        assert_eq!(err.to_string(), "node N3 consumes spot, which nothing produces");
    }

    /// Node `i` produces `v{i}` and sits at `ranks[i]` in a hidden order.
    /// Each node consumes the node ranked just before it, plus any
    /// earlier-ranked node whose bit is set in its mask. With
    /// `close_cycle` the first-ranked node also consumes the last one.
    fn ranked_graph(ranks: &[usize], masks: &[u16], close_cycle: bool) -> GraphBuilder {
        let mut b = GraphBuilder::new("ranked");
        for (i, &rank) in ranks.iter().enumerate() {
            let mut inputs: Vec<String> = ranks
                .iter()
                .enumerate()
                .filter(|&(j, &r)| r + 1 == rank || (r < rank && masks[i] & (1 << j) != 0))
                .map(|(j, _)| format!("v{j}"))
                .collect();
            if close_cycle && rank == 0 {
                let last = ranks.iter().position(|&r| r + 1 == ranks.len()).unwrap();
                inputs.push(format!("v{last}"));
            }
            b.add_node("f", inputs, [format!("v{i}")]);
        }
        b
    }

    fn ranks_and_masks() -> impl Strategy<Value = (Vec<usize>, Vec<u16>)> {
        (1usize..12).prop_flat_map(|n| {
            (
                Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
                proptest::collection::vec(any::<u16>(), n),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_topological_order_respects_every_edge((ranks, masks) in ranks_and_masks()) {
            let graph = ranked_graph(&ranks, &masks, false).build().unwrap();
            let order = graph.topological_order();
            prop_assert_eq!(order.len(), ranks.len());

            let mut position = vec![usize::MAX; order.len()];
            for (at, id) in order.iter().enumerate() {
                position[id.index()] = at;
            }
            for node in graph.nodes() {
                for dep in node.input_nodes() {
                    prop_assert!(position[dep.index()] < position[node.id().index()]);
                }
            }
        }

        #[test]
        fn prop_closing_edge_is_rejected_as_cycle((ranks, masks) in ranks_and_masks()) {
            match ranked_graph(&ranks, &masks, true).build() {
                Err(GraphError::Cycle { nodes }) => {
                    prop_assert!(!nodes.is_empty());
                    prop_assert!(nodes.iter().all(|id| id.index() < ranks.len()));
                }
                other => prop_assert!(false, "expected a cycle, got {:?}", other.map(|g| g.len())),
            }
        }
    }
}
