//! Fragments and the fragment tree.
//!
//! Fragments live in an arena indexed by [`FragmentId`]. Merging leaves a
//! tombstone behind so ids never shift. The root fragment owns no nodes;
//! it aggregates every fragment that no other fragment consumes.

use crate::colour::ExecutionColour;
use crate::error::PlanError;
use calcgrid_core::NodeId;
use calcgrid_graph::Graph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Fragment identifier - index into the fragment arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentId(u32);

impl FragmentId {
    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Arena position
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl From<NodeId> for FragmentId {
    fn from(node: NodeId) -> Self {
        Self(node.as_u32())
    }
}

impl std::fmt::Display for FragmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// A group of nodes executed together as one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub(crate) id: FragmentId,
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) inputs: BTreeSet<FragmentId>,
    pub(crate) outputs: BTreeSet<FragmentId>,
    pub(crate) tails: Vec<FragmentId>,
    pub(crate) colour: Option<ExecutionColour>,
}

impl Fragment {
    fn singleton(id: FragmentId, node: NodeId) -> Self {
        Self {
            id,
            nodes: vec![node],
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
            tails: Vec::new(),
            colour: None,
        }
    }

    /// Fragment id
    #[must_use]
    pub fn id(&self) -> FragmentId {
        self.id
    }

    /// Nodes in graph topological order
    #[must_use]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True only for the root fragment
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fragments whose outputs this fragment consumes
    #[must_use]
    pub fn inputs(&self) -> &BTreeSet<FragmentId> {
        &self.inputs
    }

    /// Fragments consuming this fragment's outputs (the root is implicit)
    #[must_use]
    pub fn outputs(&self) -> &BTreeSet<FragmentId> {
        &self.outputs
    }

    /// Fragments whose sole input is this fragment
    #[must_use]
    pub fn tails(&self) -> &[FragmentId] {
        &self.tails
    }

    /// Execution colour, when the concurrency limit is bounded
    #[must_use]
    pub fn colour(&self) -> Option<ExecutionColour> {
        self.colour
    }

    /// True if the fragment contains the node
    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }
}

/// Arena of fragments produced by partitioning one graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentTree {
    fragments: Vec<Option<Fragment>>,
    root: Fragment,
    node_fragment: Vec<FragmentId>,
    node_rank: Vec<usize>,
    order: Vec<FragmentId>,
}

impl FragmentTree {
    /// One fragment per node, with fragment ids equal to node ids
    #[must_use]
    pub fn singletons(graph: &Graph) -> Self {
        let mut fragments: Vec<Option<Fragment>> = graph
            .node_ids()
            .map(|node| Some(Fragment::singleton(FragmentId::from(node), node)))
            .collect();

        for node in graph.nodes() {
            let id = FragmentId::from(node.id());
            for dep in node.input_nodes() {
                let dep = FragmentId::from(*dep);
                if let Some(f) = fragments[id.index()].as_mut() {
                    f.inputs.insert(dep);
                }
                if let Some(f) = fragments[dep.index()].as_mut() {
                    f.outputs.insert(id);
                }
            }
        }

        let mut node_rank = vec![0; graph.len()];
        for (rank, node) in graph.topological_order().iter().enumerate() {
            node_rank[node.index()] = rank;
        }

        let mut tree = Self {
            root: Fragment {
                id: FragmentId(graph.len() as u32),
                nodes: Vec::new(),
                inputs: BTreeSet::new(),
                outputs: BTreeSet::new(),
                tails: Vec::new(),
                colour: None,
            },
            node_fragment: graph.node_ids().map(FragmentId::from).collect(),
            node_rank,
            order: Vec::new(),
            fragments,
        };
        tree.refresh_root();
        tree.order = graph.topological_order().iter().map(|n| FragmentId::from(*n)).collect();
        tree
    }

    /// Root aggregation fragment id
    #[must_use]
    pub fn root(&self) -> FragmentId {
        self.root.id
    }

    /// Root aggregation fragment
    #[must_use]
    pub fn root_fragment(&self) -> &Fragment {
        &self.root
    }

    /// Look up a live fragment (including the root)
    #[must_use]
    pub fn fragment(&self, id: FragmentId) -> Option<&Fragment> {
        if id == self.root.id {
            return Some(&self.root);
        }
        self.fragments.get(id.index()).and_then(Option::as_ref)
    }

    /// Look up a live fragment, failing on unknown ids
    ///
    /// # Errors
    ///
    /// Returns `UnknownFragment` for merged-away or out-of-range ids.
    pub fn get(&self, id: FragmentId) -> Result<&Fragment, PlanError> {
        self.fragment(id).ok_or(PlanError::UnknownFragment(id))
    }

    /// Live non-root fragments in id order
    pub fn fragments(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter().flatten()
    }

    /// Live non-root fragment ids in id order
    pub fn ids(&self) -> impl Iterator<Item = FragmentId> + '_ {
        self.fragments().map(|f| f.id)
    }

    /// Number of live non-root fragments
    #[must_use]
    pub fn len(&self) -> usize {
        self.fragments().count()
    }

    /// True when the graph had no nodes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fragment containing a node
    #[must_use]
    pub fn fragment_of(&self, node: NodeId) -> Option<FragmentId> {
        self.node_fragment.get(node.index()).copied()
    }

    /// Non-root fragments, producers before consumers, lowest id first
    #[must_use]
    pub fn topological_order(&self) -> &[FragmentId] {
        &self.order
    }

    /// Distinct execution colours in use
    #[must_use]
    pub fn colours(&self) -> BTreeSet<ExecutionColour> {
        self.fragments().filter_map(|f| f.colour).collect()
    }

    /// Node sets of every live fragment, in id order
    #[must_use]
    pub fn node_sets(&self) -> Vec<Vec<NodeId>> {
        self.fragments().map(|f| f.nodes.clone()).collect()
    }

    pub(crate) fn fragment_mut(&mut self, id: FragmentId) -> Option<&mut Fragment> {
        self.fragments.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub(crate) fn arena_len(&self) -> usize {
        self.fragments.len()
    }

    /// Fold `absorbed` into `kept`; `kept` keeps its id.
    pub(crate) fn merge(&mut self, kept: FragmentId, absorbed: FragmentId) {
        if kept == absorbed {
            return;
        }
        let Some(gone) = self.fragments.get_mut(absorbed.index()).and_then(Option::take) else {
            return;
        };

        for input in &gone.inputs {
            if let Some(f) = self.fragment_mut(*input) {
                f.outputs.remove(&absorbed);
                if *input != kept {
                    f.outputs.insert(kept);
                }
            }
        }
        for output in &gone.outputs {
            if let Some(f) = self.fragment_mut(*output) {
                f.inputs.remove(&absorbed);
                if *output != kept {
                    f.inputs.insert(kept);
                }
            }
        }
        for node in &gone.nodes {
            self.node_fragment[node.index()] = kept;
        }

        if let Some(f) = self.fragment_mut(kept) {
            f.nodes.extend(gone.nodes);
            f.inputs.extend(gone.inputs);
            f.outputs.extend(gone.outputs);
            f.inputs.remove(&kept);
            f.inputs.remove(&absorbed);
            f.outputs.remove(&kept);
            f.outputs.remove(&absorbed);
        }
    }

    /// Restore the derived state after merging: node order inside each
    /// fragment, root inputs, and the fragment topological order.
    pub(crate) fn finalize(&mut self) -> Result<(), PlanError> {
        let ranks = &self.node_rank;
        for fragment in self.fragments.iter_mut().flatten() {
            fragment.nodes.sort_by_key(|n| ranks[n.index()]);
        }
        self.refresh_root();
        self.order = self.compute_order()?;
        Ok(())
    }

    pub(crate) fn clear_colouring(&mut self) {
        for fragment in self.fragments.iter_mut().flatten() {
            fragment.tails.clear();
            fragment.colour = None;
        }
    }

    fn refresh_root(&mut self) {
        self.root.inputs = self
            .fragments
            .iter()
            .flatten()
            .filter(|f| f.outputs.is_empty())
            .map(|f| f.id)
            .collect();
    }

    fn compute_order(&self) -> Result<Vec<FragmentId>, PlanError> {
        let mut remaining: Vec<usize> = self
            .fragments
            .iter()
            .map(|f| f.as_ref().map_or(0, |f| f.inputs.len()))
            .collect();
        let mut ready: BTreeSet<FragmentId> = self
            .fragments()
            .filter(|f| f.inputs.is_empty())
            .map(|f| f.id)
            .collect();
        let mut order = Vec::with_capacity(self.fragments.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            if let Some(fragment) = self.fragment(next) {
                for output in &fragment.outputs {
                    let count = &mut remaining[output.index()];
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*output);
                    }
                }
            }
        }

        let live = self.len();
        if order.len() != live {
            let ordered: BTreeSet<FragmentId> = order.iter().copied().collect();
            return Err(PlanError::Cycle {
                fragments: self.ids().filter(|id| !ordered.contains(id)).collect(),
            });
        }
        Ok(order)
    }
}
