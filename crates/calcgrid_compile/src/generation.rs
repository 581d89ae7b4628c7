//! Immutable compilation generations.

use crate::entry::CompiledFunctionEntry;
use crate::function::CompileError;
use calcgrid_core::{NodeId, Timestamp};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Snapshot of compiled entries per node, built for one instant
///
/// Generations never change once published. The neighbour links point at
/// the generations this one was derived from and do not keep them alive.
#[derive(Debug)]
pub struct CompilationGeneration {
    at: Timestamp,
    entries: Vec<Option<Arc<CompiledFunctionEntry>>>,
    failures: BTreeMap<NodeId, CompileError>,
    earlier: Weak<CompilationGeneration>,
    later: Weak<CompilationGeneration>,
}

impl CompilationGeneration {
    pub(crate) fn new(
        at: Timestamp,
        entries: Vec<Option<Arc<CompiledFunctionEntry>>>,
        failures: BTreeMap<NodeId, CompileError>,
        earlier: Option<&Arc<CompilationGeneration>>,
        later: Option<&Arc<CompilationGeneration>>,
    ) -> Self {
        Self {
            at,
            entries,
            failures,
            earlier: earlier.map(Arc::downgrade).unwrap_or_default(),
            later: later.map(Arc::downgrade).unwrap_or_default(),
        }
    }

    /// Instant the generation was built for
    #[must_use]
    pub fn at(&self) -> Timestamp {
        self.at
    }

    /// Entry for a node, if it compiled
    #[must_use]
    pub fn entry(&self, node: NodeId) -> Option<&Arc<CompiledFunctionEntry>> {
        self.entries.get(node.index()).and_then(Option::as_ref)
    }

    /// Nodes whose compilation failed
    #[must_use]
    pub fn failures(&self) -> &BTreeMap<NodeId, CompileError> {
        &self.failures
    }

    /// True when every node compiled
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of node slots
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the generation has no node slots
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nearest earlier generation this was derived from, if still retained
    #[must_use]
    pub fn earlier(&self) -> Option<Arc<CompilationGeneration>> {
        self.earlier.upgrade()
    }

    /// Nearest later generation this was derived from, if still retained
    #[must_use]
    pub fn later(&self) -> Option<Arc<CompilationGeneration>> {
        self.later.upgrade()
    }
}

/// Handle to one compilation generation
///
/// Cheap to clone. Each cache query that builds a generation returns a
/// distinct handle; entries carried over from a neighbour are shared.
#[derive(Debug, Clone)]
pub struct CompiledRepository {
    generation: Arc<CompilationGeneration>,
}

impl CompiledRepository {
    pub(crate) fn new(generation: Arc<CompilationGeneration>) -> Self {
        Self { generation }
    }

    /// Instant the repository was compiled for
    #[must_use]
    pub fn at(&self) -> Timestamp {
        self.generation.at
    }

    /// Compiled entry for a node
    ///
    /// # Errors
    ///
    /// Returns the node's compilation error if it failed to compile.
    pub fn entry(&self, node: NodeId) -> Result<Arc<CompiledFunctionEntry>, CompileError> {
        if let Some(err) = self.generation.failures.get(&node) {
            return Err(err.clone());
        }
        self.generation
            .entry(node)
            .cloned()
            .ok_or_else(|| CompileError::Failed {
                function: format!("{node}").into(),
                reason: "node is not part of the compiled graph".to_string(),
            })
    }

    /// Nodes whose compilation failed
    #[must_use]
    pub fn failures(&self) -> &BTreeMap<NodeId, CompileError> {
        self.generation.failures()
    }

    /// Underlying generation
    #[must_use]
    pub fn generation(&self) -> &Arc<CompilationGeneration> {
        &self.generation
    }

    /// True if both handles point at the same generation
    #[must_use]
    pub fn same_generation(&self, other: &CompiledRepository) -> bool {
        Arc::ptr_eq(&self.generation, &other.generation)
    }
}
