//! Execution plans.

use crate::colour::ExecutionColour;
use crate::config::PartitionConfig;
use crate::error::PlanError;
use crate::fragment::{Fragment, FragmentId, FragmentTree};
use crate::partition::Partitioner;
use crate::visibility::{self, CacheVisibility, Visibility};
use calcgrid_core::{NodeId, ValueId};
use calcgrid_graph::Graph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A partitioned, classified graph ready for execution
///
/// Plans are immutable and may be reused by any number of execution
/// requests against the same graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    graph: Arc<Graph>,
    config: PartitionConfig,
    tree: FragmentTree,
    visibility: BTreeMap<FragmentId, CacheVisibility>,
}

impl ExecutionPlan {
    /// Partition and classify a graph
    ///
    /// # Errors
    ///
    /// Returns any error raised by [`Partitioner::partition`].
    pub fn build(graph: Arc<Graph>, config: PartitionConfig) -> Result<Self, PlanError> {
        let tree = Partitioner::new(config).partition(&graph)?;
        let visibility = visibility::classify_all(&graph, &tree)?;
        Ok(Self {
            graph,
            config,
            tree,
            visibility,
        })
    }

    /// Graph being executed
    #[must_use]
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Parameters the plan was built with
    #[must_use]
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Fragment tree
    #[must_use]
    pub fn tree(&self) -> &FragmentTree {
        &self.tree
    }

    /// Visibility of one fragment's values
    ///
    /// # Errors
    ///
    /// Returns `UnknownFragment` if the fragment is not part of the plan.
    pub fn visibility(&self, fragment: FragmentId) -> Result<&CacheVisibility, PlanError> {
        self.visibility
            .get(&fragment)
            .ok_or(PlanError::UnknownFragment(fragment))
    }

    /// Human and machine readable summary
    #[must_use]
    pub fn report(&self) -> PlanReport {
        let fragments = self
            .tree
            .topological_order()
            .iter()
            .filter_map(|id| self.tree.fragment(*id))
            .map(|fragment| self.fragment_report(fragment))
            .collect();

        PlanReport {
            graph: self.graph.name().to_string(),
            nodes: self.graph.len(),
            config: self.config,
            colours: self.tree.colours().len(),
            root_inputs: self.tree.root_fragment().inputs().iter().copied().collect(),
            fragments,
        }
    }

    fn fragment_report(&self, fragment: &Fragment) -> FragmentReport {
        let classes = self.visibility.get(&fragment.id()).cloned().unwrap_or_default();
        FragmentReport {
            id: fragment.id(),
            nodes: fragment.nodes().to_vec(),
            inputs: fragment.inputs().iter().copied().collect(),
            tails: fragment.tails().to_vec(),
            colour: fragment.colour(),
            private_values: classes.values_with(Visibility::Private).cloned().collect(),
            shared_values: classes.values_with(Visibility::Shared).cloned().collect(),
            shared_inputs: classes.shared_inputs().iter().cloned().collect(),
        }
    }
}

/// Summary of one fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentReport {
    /// Fragment id
    pub id: FragmentId,
    /// Member nodes, in execution order
    pub nodes: Vec<NodeId>,
    /// Input fragments
    pub inputs: Vec<FragmentId>,
    /// Tail fragments
    pub tails: Vec<FragmentId>,
    /// Execution colour, if assigned
    pub colour: Option<ExecutionColour>,
    /// Values kept inside the job
    pub private_values: Vec<ValueId>,
    /// Values published to the shared cache
    pub shared_values: Vec<ValueId>,
    /// Values read from the shared cache
    pub shared_inputs: Vec<ValueId>,
}

/// Summary of an execution plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReport {
    /// Graph label
    pub graph: String,
    /// Node count
    pub nodes: usize,
    /// Partition parameters
    pub config: PartitionConfig,
    /// Distinct execution colours
    pub colours: usize,
    /// Fragments feeding the root aggregation fragment
    pub root_inputs: Vec<FragmentId>,
    /// Fragments, producers first
    pub fragments: Vec<FragmentReport>,
}

impl std::fmt::Display for PlanReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{}: {} nodes in {} fragments, {} colours",
            self.graph,
            self.nodes,
            self.fragments.len(),
            self.colours
        )?;
        for fragment in &self.fragments {
            let nodes: Vec<String> = fragment.nodes.iter().map(ToString::to_string).collect();
            let inputs: Vec<String> = fragment.inputs.iter().map(ToString::to_string).collect();
            write!(f, "  {} [{}]", fragment.id, nodes.join(" "))?;
            if !inputs.is_empty() {
                write!(f, " <- {}", inputs.join(" "))?;
            }
            if let Some(colour) = fragment.colour {
                write!(f, " ({colour})")?;
            }
            writeln!(
                f,
                " private={} shared={}",
                fragment.private_values.len(),
                fragment.shared_values.len()
            )?;
        }
        let roots: Vec<String> = self.root_inputs.iter().map(ToString::to_string).collect();
        write!(f, "  root <- {}", roots.join(" "))
    }
}
