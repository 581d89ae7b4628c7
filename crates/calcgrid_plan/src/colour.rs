//! Tail detection and execution colouring.
//!
//! A tail of fragment P is a fragment whose only input is P. Each colour
//! is an execution lane: a head fragment followed by at most
//! `concurrency_limit` tails pipelined behind it. Fragments are coloured
//! in topological order, lowest id first.

use crate::fragment::{FragmentId, FragmentTree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Execution lane identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionColour(u32);

impl ExecutionColour {
    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ExecutionColour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lane-{}", self.0)
    }
}

/// Record tails on every fragment and assign colours.
///
/// Returns the number of colours used.
pub(crate) fn assign(tree: &mut FragmentTree, concurrency_limit: usize) -> usize {
    tree.clear_colouring();

    let mut tails: BTreeMap<FragmentId, Vec<FragmentId>> = BTreeMap::new();
    let mut producer_of: BTreeMap<FragmentId, FragmentId> = BTreeMap::new();
    for fragment in tree.fragments() {
        if fragment.inputs().len() == 1 {
            if let Some(producer) = fragment.inputs().first() {
                tails.entry(*producer).or_default().push(fragment.id());
                producer_of.insert(fragment.id(), *producer);
            }
        }
    }

    // tails used per lane
    let mut lanes: Vec<usize> = Vec::new();
    let mut colour_of: BTreeMap<FragmentId, usize> = BTreeMap::new();
    let mut handed_on: BTreeMap<FragmentId, bool> = BTreeMap::new();

    let order = tree.topological_order().to_vec();
    for id in order {
        let continued = producer_of.get(&id).and_then(|producer| {
            let lane = *colour_of.get(producer)?;
            let free = !handed_on.get(producer).copied().unwrap_or(false)
                && lanes[lane] < concurrency_limit;
            free.then(|| {
                handed_on.insert(*producer, true);
                lanes[lane] += 1;
                lane
            })
        });

        let lane = continued.unwrap_or_else(|| {
            lanes.push(usize::from(producer_of.contains_key(&id)));
            lanes.len() - 1
        });
        colour_of.insert(id, lane);
    }

    for (id, lane) in &colour_of {
        if let Some(fragment) = tree.fragment_mut(*id) {
            fragment.colour = Some(ExecutionColour(*lane as u32));
            fragment.tails = tails.remove(id).unwrap_or_default();
        }
    }

    tracing::debug!(
        colours = lanes.len(),
        concurrency_limit,
        "assigned execution colours"
    );
    lanes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcgrid_core::NodeId;
    use calcgrid_graph::sample;

    fn coloured_chains(limit: usize) -> (FragmentTree, usize) {
        let graph = sample::chains_graph();
        let mut tree = FragmentTree::singletons(&graph);
        let used = assign(&mut tree, limit);
        (tree, used)
    }

    fn colour_of(tree: &FragmentTree, node: u32) -> ExecutionColour {
        let id = tree.fragment_of(NodeId::from_raw(node)).unwrap();
        tree.get(id).unwrap().colour().unwrap()
    }

    #[test]
    fn test_tails_recorded() {
        let (tree, _) = coloured_chains(1);
        let a = tree.get(FragmentId::from_raw(0)).unwrap();
        assert_eq!(
            a.tails(),
            &[FragmentId::from_raw(1), FragmentId::from_raw(3), FragmentId::from_raw(5)]
        );
        assert!(tree.get(FragmentId::from_raw(7)).unwrap().tails().is_empty());
    }

    #[test]
    fn test_limit_one_gives_seven_lanes() {
        let (tree, used) = coloured_chains(1);
        assert_eq!(used, 7);
        assert_eq!(tree.colours().len(), 7);
        // A and B1 share the only pipelined slot
        assert_eq!(colour_of(&tree, 0), colour_of(&tree, 1));
    }

    #[test]
    fn test_limit_two_gives_four_lanes() {
        let (tree, used) = coloured_chains(2);
        assert_eq!(used, 4);
        assert_eq!(colour_of(&tree, 5), colour_of(&tree, 6));
        assert_ne!(colour_of(&tree, 6), colour_of(&tree, 7));
    }

    #[test]
    fn test_limit_three_follows_chains() {
        let (tree, used) = coloured_chains(3);
        assert_eq!(used, 3);
        let lanes: Vec<Vec<u32>> = [vec![0, 1, 2], vec![3, 4], vec![5, 6, 7]]
            .into_iter()
            .map(|group| group.into_iter().map(|n| colour_of(&tree, n).as_u32()).collect())
            .collect();
        assert_eq!(lanes, vec![vec![0, 0, 0], vec![1, 1], vec![2, 2, 2]]);
    }

    #[test]
    fn test_recolouring_is_stable() {
        let (mut tree, _) = coloured_chains(2);
        let before = tree.clone();
        assign(&mut tree, 2);
        assert_eq!(tree, before);
    }
}
