//! Cache visibility classification.
//!
//! A value produced by a fragment is private when every node consuming it
//! sits in the same fragment and no external requirement asks for it.
//! Everything else crosses a job boundary and goes to the shared cache.

use crate::fragment::{FragmentId, FragmentTree};
use crate::error::PlanError;
use calcgrid_core::ValueId;
use calcgrid_graph::Graph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Where a produced value is cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Visible only inside the producing job
    Private,
    /// Visible to every job of the execution
    Shared,
}

/// Visibility of every value one fragment touches
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheVisibility {
    produced: BTreeMap<ValueId, Visibility>,
    shared_inputs: BTreeSet<ValueId>,
}

impl CacheVisibility {
    /// Visibility of a produced value
    #[must_use]
    pub fn visibility_of(&self, value: &ValueId) -> Option<Visibility> {
        self.produced.get(value).copied()
    }

    /// True if the value is produced here and stays private
    #[must_use]
    pub fn is_private(&self, value: &ValueId) -> bool {
        self.visibility_of(value) == Some(Visibility::Private)
    }

    /// Every produced value with its visibility
    #[must_use]
    pub fn produced(&self) -> &BTreeMap<ValueId, Visibility> {
        &self.produced
    }

    /// Produced values with the given visibility
    pub fn values_with(&self, visibility: Visibility) -> impl Iterator<Item = &ValueId> {
        self.produced
            .iter()
            .filter(move |(_, v)| **v == visibility)
            .map(|(id, _)| id)
    }

    /// Values read from the shared cache (produced elsewhere or root inputs)
    #[must_use]
    pub fn shared_inputs(&self) -> &BTreeSet<ValueId> {
        &self.shared_inputs
    }
}

/// Classify the values of one fragment
///
/// # Errors
///
/// Returns `UnknownFragment` if `fragment` is not live in `tree`.
pub fn classify(
    graph: &Graph,
    tree: &FragmentTree,
    fragment: FragmentId,
) -> Result<CacheVisibility, PlanError> {
    let members = tree.get(fragment)?;
    let mut visibility = CacheVisibility::default();

    for node_id in members.nodes() {
        let Some(node) = graph.node(*node_id) else {
            continue;
        };

        for value in node.outputs() {
            let local = graph
                .consumers_of(value)
                .all(|consumer| tree.fragment_of(consumer) == Some(fragment));
            let class = if local && !graph.is_terminal(value) {
                Visibility::Private
            } else {
                Visibility::Shared
            };
            visibility.produced.insert(value.clone(), class);
        }

        for value in node.inputs() {
            let produced_here = graph
                .producer_of(value)
                .is_some_and(|p| tree.fragment_of(p) == Some(fragment));
            if !produced_here {
                visibility.shared_inputs.insert(value.clone());
            }
        }
    }

    Ok(visibility)
}

/// Classify every live fragment
///
/// # Errors
///
/// Never fails for a tree produced from `graph`; an inconsistent tree
/// reports `UnknownFragment`.
pub fn classify_all(
    graph: &Graph,
    tree: &FragmentTree,
) -> Result<BTreeMap<FragmentId, CacheVisibility>, PlanError> {
    tree.ids()
        .map(|id| classify(graph, tree, id).map(|v| (id, v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PartitionConfig, Partitioner};
    use calcgrid_core::NodeId;
    use calcgrid_graph::{GraphBuilder, sample};
    use proptest::prelude::*;

    fn v(name: &str) -> ValueId {
        ValueId::from(name)
    }

    fn plan(graph: &Graph, config: PartitionConfig) -> (FragmentTree, BTreeMap<FragmentId, CacheVisibility>) {
        let tree = Partitioner::new(config).partition(graph).unwrap();
        let classes = classify_all(graph, &tree).unwrap();
        (tree, classes)
    }

    fn class_of(
        graph: &Graph,
        tree: &FragmentTree,
        classes: &BTreeMap<FragmentId, CacheVisibility>,
        value: &str,
    ) -> Visibility {
        let producer = graph.producer_of(&v(value)).unwrap();
        let fragment = tree.fragment_of(producer).unwrap();
        classes[&fragment].visibility_of(&v(value)).unwrap()
    }

    #[test]
    fn test_single_fragment_keeps_intermediates_private() {
        let graph = sample::fan_out_graph();
        let (tree, classes) = plan(&graph, PartitionConfig::new(5, None));

        for value in ["N2.a", "N2.b", "N2.c", "N3.out"] {
            assert_eq!(class_of(&graph, &tree, &classes, value), Visibility::Private, "{value}");
        }
        for value in ["N0.out", "N1.out", "N4.out"] {
            assert_eq!(class_of(&graph, &tree, &classes, value), Visibility::Shared, "{value}");
        }
        let only = classes.values().next().unwrap();
        assert!(only.shared_inputs().is_empty());
    }

    #[test]
    fn test_identity_shares_every_edge() {
        let graph = sample::fan_out_graph();
        let (tree, classes) = plan(&graph, PartitionConfig::identity());
        for value in ["N2.a", "N2.b", "N2.c", "N3.out", "N0.out", "N1.out", "N4.out"] {
            assert_eq!(class_of(&graph, &tree, &classes, value), Visibility::Shared, "{value}");
        }
        let n4 = tree.fragment_of(NodeId::from_raw(4)).unwrap();
        assert_eq!(
            classes[&n4].shared_inputs(),
            &BTreeSet::from([v("N2.c"), v("N3.out")])
        );
    }

    #[test]
    fn test_pairs_share_only_boundary_values() {
        let graph = sample::fan_out_graph();
        let (tree, classes) = plan(&graph, PartitionConfig::new(2, Some(2)));

        for value in ["N2.a", "N2.b", "N2.c"] {
            assert_eq!(class_of(&graph, &tree, &classes, value), Visibility::Shared, "{value}");
        }
        assert_eq!(class_of(&graph, &tree, &classes, "N3.out"), Visibility::Private);

        let n4 = tree.fragment_of(NodeId::from_raw(4)).unwrap();
        assert_eq!(classes[&n4].shared_inputs(), &BTreeSet::from([v("N2.c")]));
        assert_eq!(
            classes[&n4].values_with(Visibility::Private).collect::<Vec<_>>(),
            vec![&v("N3.out")]
        );
    }

    #[test]
    fn test_unconsumed_intermediate_is_private() {
        let mut b = GraphBuilder::new("scratch");
        b.add_node("seed", Vec::<&str>::new(), ["kept", "scratch"]);
        b.add_terminal_output("K", "kept");
        let graph = b.build().unwrap();
        let (tree, classes) = plan(&graph, PartitionConfig::default());
        assert_eq!(class_of(&graph, &tree, &classes, "scratch"), Visibility::Private);
        assert_eq!(class_of(&graph, &tree, &classes, "kept"), Visibility::Shared);
    }

    #[test]
    fn test_unknown_fragment() {
        let graph = sample::fan_out_graph();
        let tree = Partitioner::new(PartitionConfig::new(5, None)).partition(&graph).unwrap();
        assert!(matches!(
            classify(&graph, &tree, FragmentId::from_raw(3)),
            Err(PlanError::UnknownFragment(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_private_iff_all_consumers_local(
            n in 2usize..16,
            fan in proptest::collection::vec(0usize..100, 16),
            min in 1usize..5,
        ) {
            let mut b = GraphBuilder::new("random");
            b.add_node("seed", Vec::<&str>::new(), ["v0"]);
            for i in 1..n {
                let dep = fan[i] % i;
                b.add_node("sum", [format!("v{dep}")], [format!("v{i}")]);
            }
            b.add_terminal_output("last", format!("v{}", n - 1));
            let graph = b.build().unwrap();
            let (tree, classes) = plan(&graph, PartitionConfig::new(min, None));

            for node in graph.nodes() {
                let here = tree.fragment_of(node.id()).unwrap();
                for value in node.outputs() {
                    let external = graph.is_terminal(value)
                        || graph.consumers_of(value).any(|c| tree.fragment_of(c) != Some(here));
                    let expected = if external { Visibility::Shared } else { Visibility::Private };
                    prop_assert_eq!(classes[&here].visibility_of(value), Some(expected));
                }
            }

            // reclassifying an unchanged tree gives the same answer
            prop_assert_eq!(classify_all(&graph, &tree).unwrap(), classes);
        }
    }
}
