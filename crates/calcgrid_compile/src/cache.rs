//! The time-windowed compilation cache.

use crate::entry::CompiledFunctionEntry;
use crate::function::{CompileError, FunctionRepository};
use crate::generation::{CompilationGeneration, CompiledRepository};
use calcgrid_core::{NodeId, Timestamp};
use calcgrid_graph::{Graph, GraphNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type GenerationIndex = BTreeMap<Timestamp, Arc<CompilationGeneration>>;

/// Compilation cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum generations retained at once
    pub retained_generations: usize,
}

impl CacheConfig {
    /// Create a new cache config
    #[must_use]
    pub fn new() -> Self {
        Self {
            retained_generations: 8,
        }
    }

    /// Set the retention bound (at least one generation is always kept)
    #[must_use]
    pub fn with_retained_generations(mut self, count: usize) -> Self {
        self.retained_generations = count.max(1);
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters describing cache behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Generations currently retained
    pub generations: usize,
    /// Entries compiled from scratch
    pub compilations: u64,
    /// Entries carried over from a neighbouring generation
    pub reused: u64,
    /// Queries answered by an existing generation
    pub exact_hits: u64,
    /// Compilation failures recorded
    pub failures: u64,
}

/// Compilation cache for one graph
///
/// Lookups take a short read lock on the published index. Builds are
/// serialized and publish a fresh index, so readers never observe a
/// partially built generation.
pub struct CompilationCache {
    graph: Arc<Graph>,
    functions: Arc<FunctionRepository>,
    config: CacheConfig,
    published: RwLock<Arc<GenerationIndex>>,
    build_lock: Mutex<()>,
    compilations: AtomicU64,
    reused: AtomicU64,
    exact_hits: AtomicU64,
    failures: AtomicU64,
}

impl CompilationCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(graph: Arc<Graph>, functions: Arc<FunctionRepository>, config: CacheConfig) -> Self {
        Self {
            graph,
            functions,
            config,
            published: RwLock::new(Arc::new(BTreeMap::new())),
            build_lock: Mutex::new(()),
            compilations: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            exact_hits: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Graph this cache compiles
    #[must_use]
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Compiled functions for every node of the graph at `at`
    ///
    /// Nodes that fail to compile are reported through
    /// [`CompiledRepository::entry`]; they are never published and are
    /// retried by the next query.
    pub fn compile(&self, at: Timestamp) -> CompiledRepository {
        if let Some(generation) = self.exact(&self.snapshot(), at) {
            return CompiledRepository::new(generation);
        }

        let _guard = self.build_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let index = self.snapshot();
        if let Some(generation) = self.exact(&index, at) {
            return CompiledRepository::new(generation);
        }

        let earlier = index
            .range((Bound::Unbounded, Bound::Included(at)))
            .next_back()
            .map(|(_, g)| Arc::clone(g));
        let later = index
            .range((Bound::Excluded(at), Bound::Unbounded))
            .next()
            .map(|(_, g)| Arc::clone(g));

        let mut entries = Vec::with_capacity(self.graph.len());
        let mut failures = BTreeMap::new();
        let mut reused = 0u64;
        let mut compiled = 0u64;

        for node in self.graph.nodes() {
            let carried = [earlier.as_ref(), later.as_ref()]
                .into_iter()
                .flatten()
                .filter_map(|g| g.entry(node.id()))
                .find(|e| e.is_valid_at(at))
                .cloned();

            if let Some(entry) = carried {
                reused += 1;
                entries.push(Some(entry));
                continue;
            }

            compiled += 1;
            match self.compile_node(node, at) {
                Ok(entry) => entries.push(Some(Arc::new(entry))),
                Err(err) => {
                    tracing::warn!(node = %node.id(), error = %err, "compilation failed");
                    failures.insert(node.id(), err);
                    entries.push(None);
                }
            }
        }

        self.compilations.fetch_add(compiled, Ordering::Relaxed);
        self.reused.fetch_add(reused, Ordering::Relaxed);
        self.failures
            .fetch_add(failures.len() as u64, Ordering::Relaxed);

        tracing::debug!(
            at = %at,
            compiled,
            reused,
            failed = failures.len(),
            "built compilation generation"
        );

        let generation = Arc::new(CompilationGeneration::new(
            at,
            entries,
            failures,
            earlier.as_ref(),
            later.as_ref(),
        ));
        self.publish(&index, at, Arc::clone(&generation));
        CompiledRepository::new(generation)
    }

    /// Drop every generation built for an instant before `cutoff`
    pub fn invalidate_before(&self, cutoff: Timestamp) {
        let _guard = self.build_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let index = self.snapshot();
        let kept: GenerationIndex = index
            .range((Bound::Included(cutoff), Bound::Unbounded))
            .map(|(t, g)| (*t, Arc::clone(g)))
            .collect();
        tracing::debug!(
            cutoff = %cutoff,
            dropped = index.len() - kept.len(),
            "invalidated generations"
        );
        self.store(Arc::new(kept));
    }

    /// Instants of retained generations, oldest first
    #[must_use]
    pub fn retained_instants(&self) -> Vec<Timestamp> {
        self.snapshot().keys().copied().collect()
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            generations: self.snapshot().len(),
            compilations: self.compilations.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            exact_hits: self.exact_hits.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn exact(&self, index: &GenerationIndex, at: Timestamp) -> Option<Arc<CompilationGeneration>> {
        let generation = index.get(&at).filter(|g| g.is_complete())?;
        self.exact_hits.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(generation))
    }

    fn compile_node(&self, node: &GraphNode, at: Timestamp) -> Result<CompiledFunctionEntry, CompileError> {
        let function = node.function();
        let definition = self
            .functions
            .get(function)
            .ok_or_else(|| CompileError::UnknownFunction {
                function: function.clone(),
            })?;
        let compiled = definition.compile(at)?;
        CompiledFunctionEntry::new(function.clone(), at, compiled)
    }

    fn publish(&self, index: &GenerationIndex, at: Timestamp, generation: Arc<CompilationGeneration>) {
        let mut next = index.clone();
        next.insert(at, generation);

        while next.len() > self.config.retained_generations.max(1) {
            let farthest = next
                .keys()
                .copied()
                .filter(|t| *t != at)
                .max_by_key(|t| distance(*t, at));
            match farthest {
                Some(t) => {
                    next.remove(&t);
                    tracing::debug!(evicted = %t, "evicted compilation generation");
                }
                None => break,
            }
        }

        self.store(Arc::new(next));
    }

    fn snapshot(&self) -> Arc<GenerationIndex> {
        let guard = self.published.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    fn store(&self, index: Arc<GenerationIndex>) {
        let mut guard = self.published.write().unwrap_or_else(PoisonError::into_inner);
        *guard = index;
    }
}

fn distance(a: Timestamp, b: Timestamp) -> u128 {
    if a >= b {
        a.duration_since(&b).as_nanos()
    } else {
        b.duration_since(&a).as_nanos()
    }
}

impl std::fmt::Debug for CompilationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationCache")
            .field("graph", &self.graph.name())
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
