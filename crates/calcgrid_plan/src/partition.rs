//! Fragment partitioning.
//!
//! Partitioning starts from one fragment per node and coarsens bottom-up
//! with two passes that alternate until neither changes anything:
//!
//! - **sibling merge**: fragments below `min_fragment_size` with the same
//!   non-empty set of input fragments are folded together, later into
//!   earlier, while the result stays within `max_fragment_size`;
//! - **single-dependency merge**: a fragment consumed by exactly one other
//!   fragment is folded into that consumer when the result stays within
//!   `max_fragment_size`.
//!
//! Both passes walk fragments in id order, so the same graph and
//! parameters always yield the same tree.

use crate::colour;
use crate::config::PartitionConfig;
use crate::error::PlanError;
use crate::fragment::{FragmentId, FragmentTree};
use calcgrid_graph::Graph;
use std::collections::{BTreeMap, BTreeSet};

/// Splits graphs into fragments
#[derive(Debug, Clone)]
pub struct Partitioner {
    config: PartitionConfig,
}

impl Partitioner {
    /// Create a new partitioner
    #[must_use]
    pub fn new(config: PartitionConfig) -> Self {
        Self { config }
    }

    /// Parameters in use
    #[must_use]
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Partition a graph
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` before doing any work if the parameters are
    /// inconsistent, or `Cycle` if the fragment graph cannot be ordered.
    pub fn partition(&self, graph: &Graph) -> Result<FragmentTree, PlanError> {
        self.config.validate()?;

        let mut tree = FragmentTree::singletons(graph);
        let merges = self.coarsen(&mut tree)?;
        if merges == 0 {
            self.colour(&mut tree);
        }

        tracing::info!(
            graph = graph.name(),
            nodes = graph.len(),
            fragments = tree.len(),
            merges,
            colours = tree.colours().len(),
            "partitioned graph"
        );
        Ok(tree)
    }

    /// Run the merge passes to a fixed point.
    ///
    /// Returns the number of merges performed. When anything changed the
    /// tree is re-finalized and, for a bounded concurrency limit,
    /// recoloured. An already coarsened tree is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `Cycle` if the merged fragment graph cannot be ordered.
    pub fn coarsen(&self, tree: &mut FragmentTree) -> Result<usize, PlanError> {
        let mut total = 0;
        loop {
            let round = self.merge_siblings(tree) + self.merge_single_dependencies(tree);
            if round == 0 {
                break;
            }
            total += round;
        }

        if total > 0 {
            tree.finalize()?;
            self.colour(tree);
        }
        Ok(total)
    }

    fn colour(&self, tree: &mut FragmentTree) {
        match self.config.concurrency_limit {
            Some(limit) => {
                colour::assign(tree, limit);
            }
            None => tree.clear_colouring(),
        }
    }

    fn merge_siblings(&self, tree: &mut FragmentTree) -> usize {
        let min = self.config.min_fragment_size;
        let max = self.config.max_size();
        let mut open: BTreeMap<BTreeSet<FragmentId>, FragmentId> = BTreeMap::new();
        let mut merges = 0;

        for index in 0..tree.arena_len() {
            let id = FragmentId::from_raw(index as u32);
            let Some(fragment) = tree.fragment(id) else {
                continue;
            };
            if fragment.len() >= min || fragment.inputs().is_empty() {
                continue;
            }
            let size = fragment.len();
            let key = fragment.inputs().clone();

            let Some(&candidate) = open.get(&key) else {
                open.insert(key, id);
                continue;
            };
            let combined = tree.fragment(candidate).map_or(usize::MAX, |c| c.len()) + size;
            if combined > max {
                continue;
            }

            tracing::debug!(into = %candidate, from = %id, size = combined, "sibling merge");
            tree.merge(candidate, id);
            merges += 1;
            if combined >= min {
                open.remove(&key);
            }
        }

        merges
    }

    fn merge_single_dependencies(&self, tree: &mut FragmentTree) -> usize {
        let max = self.config.max_size();
        let mut merges = 0;

        for index in 0..tree.arena_len() {
            let id = FragmentId::from_raw(index as u32);
            let Some(fragment) = tree.fragment(id) else {
                continue;
            };
            if fragment.outputs().len() != 1 {
                continue;
            }
            let Some(&consumer) = fragment.outputs().first() else {
                continue;
            };
            let size = fragment.len();
            let combined = tree.fragment(consumer).map_or(usize::MAX, |c| c.len()) + size;
            if combined > max {
                continue;
            }

            tracing::debug!(into = %consumer, from = %id, size = combined, "single-dependency merge");
            tree.merge(consumer, id);
            merges += 1;
        }

        merges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colour::ExecutionColour;
    use calcgrid_core::NodeId;
    use calcgrid_graph::{GraphBuilder, sample};
    use proptest::prelude::*;

    fn nodes(ids: &[u32]) -> Vec<NodeId> {
        ids.iter().map(|i| NodeId::from_raw(*i)).collect()
    }

    fn f(i: u32) -> FragmentId {
        FragmentId::from_raw(i)
    }

    #[test]
    fn test_large_min_collapses_to_one_fragment() {
        let graph = sample::fan_out_graph();
        let tree = Partitioner::new(PartitionConfig::new(5, None))
            .partition(&graph)
            .unwrap();

        assert_eq!(tree.len(), 1);
        let only = tree.fragments().next().unwrap();
        let mut members = only.nodes().to_vec();
        members.sort();
        assert_eq!(members, nodes(&[0, 1, 2, 3, 4]));
        assert!(only.inputs().is_empty());
        assert_eq!(tree.root_fragment().inputs(), &BTreeSet::from([only.id()]));
    }

    #[test]
    fn test_min_max_one_is_identity() {
        let graph = sample::fan_out_graph();
        let tree = Partitioner::new(PartitionConfig::identity())
            .partition(&graph)
            .unwrap();

        assert_eq!(tree, FragmentTree::singletons(&graph));
        assert!(tree.colours().is_empty());
    }

    #[test]
    fn test_min_max_two_pairs_consumers() {
        let graph = sample::fan_out_graph();
        let tree = Partitioner::new(PartitionConfig::new(2, Some(2)))
            .partition(&graph)
            .unwrap();

        assert_eq!(
            tree.node_sets(),
            vec![nodes(&[0, 1]), nodes(&[2]), nodes(&[3, 4])]
        );
        assert_eq!(tree.get(f(0)).unwrap().inputs(), &BTreeSet::from([f(2)]));
        assert_eq!(tree.get(f(4)).unwrap().inputs(), &BTreeSet::from([f(2)]));
        assert_eq!(tree.topological_order(), &[f(2), f(0), f(4)]);
    }

    #[test]
    fn test_invalid_config_rejected_up_front() {
        let graph = sample::fan_out_graph();
        let err = Partitioner::new(PartitionConfig::new(4, Some(2)))
            .partition(&graph)
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidConfig { field: "max_fragment_size", .. }));
    }

    #[test]
    fn test_sources_are_never_siblings() {
        let mut b = GraphBuilder::new("sources");
        for i in 0..4 {
            b.add_node("seed", Vec::<&str>::new(), [format!("s{i}")]);
        }
        let graph = b.build().unwrap();
        let tree = Partitioner::new(PartitionConfig::new(3, None))
            .partition(&graph)
            .unwrap();
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_empty_graph() {
        let graph = GraphBuilder::new("empty").build().unwrap();
        let tree = Partitioner::new(PartitionConfig::default())
            .partition(&graph)
            .unwrap();
        assert!(tree.is_empty());
        assert!(tree.root_fragment().inputs().is_empty());
    }

    #[test]
    fn test_chains_collapse_with_unbounded_max() {
        let graph = sample::chains_graph();
        let tree = Partitioner::new(PartitionConfig::new(1, None))
            .partition(&graph)
            .unwrap();
        // every chain folds into its terminal node; A has three consumers
        assert_eq!(
            tree.node_sets(),
            vec![nodes(&[0]), nodes(&[1, 2]), nodes(&[3, 4]), nodes(&[5, 6, 7])]
        );
    }

    #[test]
    fn test_coarsen_is_idempotent() {
        let graph = sample::fan_out_graph();
        let partitioner = Partitioner::new(PartitionConfig::new(2, Some(2)));
        let mut tree = partitioner.partition(&graph).unwrap();
        let before = tree.clone();
        assert_eq!(partitioner.coarsen(&mut tree).unwrap(), 0);
        assert_eq!(tree, before);
    }

    fn colour_of(tree: &FragmentTree, node: u32) -> ExecutionColour {
        let id = tree.fragment_of(NodeId::from_raw(node)).unwrap();
        tree.get(id).unwrap().colour().unwrap()
    }

    #[test]
    fn test_identity_chains_lane_count_per_limit() {
        let graph = sample::chains_graph();
        for (limit, lanes) in [(1, 7), (2, 4), (3, 3)] {
            let tree = Partitioner::new(PartitionConfig::identity().with_concurrency_limit(limit))
                .partition(&graph)
                .unwrap();
            assert_eq!(tree.len(), 8);
            assert_eq!(tree.colours().len(), lanes, "limit {limit}");
            assert!(tree.fragments().all(|fragment| fragment.colour().is_some()));
        }
    }

    #[test]
    fn test_merged_fragments_are_coloured() {
        let graph = sample::fan_out_graph();
        let tree = Partitioner::new(PartitionConfig::new(2, Some(2)).with_concurrency_limit(1))
            .partition(&graph)
            .unwrap();

        assert_eq!(
            tree.node_sets(),
            vec![nodes(&[0, 1]), nodes(&[2]), nodes(&[3, 4])]
        );
        assert_eq!(tree.colours().len(), 2);
        assert_eq!(tree.get(f(2)).unwrap().tails(), &[f(0), f(4)]);
        assert_eq!(colour_of(&tree, 2), colour_of(&tree, 0));
        assert_ne!(colour_of(&tree, 2), colour_of(&tree, 3));
    }

    #[test]
    fn test_folded_chains_are_coloured() {
        let graph = sample::chains_graph();
        let tree = Partitioner::new(PartitionConfig::new(1, None).with_concurrency_limit(1))
            .partition(&graph)
            .unwrap();

        assert_eq!(tree.len(), 4);
        assert_eq!(tree.colours().len(), 3);
        // A pipelines into the first chain only
        assert_eq!(colour_of(&tree, 0), colour_of(&tree, 2));
        assert_ne!(colour_of(&tree, 0), colour_of(&tree, 4));
        assert_ne!(colour_of(&tree, 4), colour_of(&tree, 7));
    }

    /// Random DAG: node i may consume any value of nodes 0..i.
    fn random_graph() -> impl Strategy<Value = Graph> {
        (1usize..24)
            .prop_flat_map(|n| {
                let edges = (0..n)
                    .map(|i| proptest::collection::vec(0..i.max(1), 0..3.min(i + 1)))
                    .collect::<Vec<_>>();
                (Just(n), edges)
            })
            .prop_map(|(n, edges)| {
                let mut b = GraphBuilder::new("random");
                for (i, deps) in edges.iter().enumerate().take(n) {
                    let inputs: BTreeSet<String> = deps
                        .iter()
                        .filter(|d| **d < i)
                        .map(|d| format!("v{d}"))
                        .collect();
                    b.add_node("sum", inputs, [format!("v{i}")]);
                }
                b.add_terminal_output("last", format!("v{}", n - 1));
                b.build().unwrap()
            })
    }

    fn config() -> impl Strategy<Value = PartitionConfig> {
        (1usize..6, proptest::option::of(0usize..6), proptest::option::of(1usize..4)).prop_map(
            |(min, extra, limit)| PartitionConfig {
                min_fragment_size: min,
                max_fragment_size: extra.map(|e| min + e),
                concurrency_limit: limit,
            },
        )
    }

    proptest! {
        #[test]
        fn prop_partition_is_deterministic(graph in random_graph(), config in config()) {
            let p = Partitioner::new(config);
            prop_assert_eq!(p.partition(&graph).unwrap(), p.partition(&graph).unwrap());
        }

        #[test]
        fn prop_every_node_in_exactly_one_fragment(graph in random_graph(), config in config()) {
            let tree = Partitioner::new(config).partition(&graph).unwrap();
            let mut seen: Vec<NodeId> = tree.fragments().flat_map(|f| f.nodes().to_vec()).collect();
            seen.sort();
            prop_assert_eq!(seen, graph.node_ids().collect::<Vec<_>>());
            for node in graph.node_ids() {
                let owner = tree.fragment_of(node).unwrap();
                prop_assert!(tree.get(owner).unwrap().contains(node));
            }
        }

        #[test]
        fn prop_sizes_within_max(graph in random_graph(), config in config()) {
            let tree = Partitioner::new(config).partition(&graph).unwrap();
            for fragment in tree.fragments() {
                prop_assert!(fragment.len() <= config.max_size());
            }
        }

        #[test]
        fn prop_no_forward_references(graph in random_graph(), config in config()) {
            let tree = Partitioner::new(config).partition(&graph).unwrap();
            let position: BTreeMap<FragmentId, usize> = tree
                .topological_order()
                .iter()
                .enumerate()
                .map(|(i, id)| (*id, i))
                .collect();
            prop_assert_eq!(position.len(), tree.len());
            for node in graph.nodes() {
                let here = tree.fragment_of(node.id()).unwrap();
                for dep in node.input_nodes() {
                    let there = tree.fragment_of(*dep).unwrap();
                    if there == here {
                        let nodes = tree.get(here).unwrap().nodes();
                        let a = nodes.iter().position(|n| n == dep).unwrap();
                        let b = nodes.iter().position(|n| *n == node.id()).unwrap();
                        prop_assert!(a < b);
                    } else {
                        prop_assert!(position[&there] < position[&here]);
                    }
                }
            }
        }

        #[test]
        fn prop_coarsen_idempotent(graph in random_graph(), config in config()) {
            let p = Partitioner::new(config);
            let mut tree = p.partition(&graph).unwrap();
            let before = tree.clone();
            prop_assert_eq!(p.coarsen(&mut tree).unwrap(), 0);
            prop_assert_eq!(tree, before);
        }
    }
}
