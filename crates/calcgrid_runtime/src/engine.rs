//! Execution engine.
//!
//! Owns an execution plan, the compilation cache for the plan's graph and
//! a dispatch backend. Each call to [`ExecutionEngine::execute`] compiles
//! the graph for the requested instant, seeds the root inputs and hands
//! the plan to the aggregator.

use crate::aggregator::{self, ExecutionError, Launch, RootFuture};
use crate::backend::DispatchBackend;
use crate::cache::SharedValueCache;
use crate::job::JobSpecificationFactory;
use crate::monitor::{ExecutionMetrics, MetricsSnapshot};
use calcgrid_compile::{CacheConfig, CacheStats, CompilationCache, FunctionRepository};
use calcgrid_core::{ProcessId, Timestamp, ValueId};
use calcgrid_graph::Graph;
use calcgrid_plan::{ExecutionPlan, PartitionConfig, PlanError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name stamped on every job specification
    pub configuration_name: String,
    /// Partition parameters
    pub partition: PartitionConfig,
    /// Compilation cache parameters
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            configuration_name: "default".to_string(),
            partition: PartitionConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("reading {path}: {source}")]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The document is not a valid configuration
    #[error("parsing configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The values are inconsistent
    #[error(transparent)]
    Invalid(#[from] PlanError),
}

impl EngineConfig {
    /// Parse and validate a JSON document
    ///
    /// # Errors
    ///
    /// Returns `Parse` for malformed JSON and `Invalid` for inconsistent
    /// partition parameters.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.partition.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read, otherwise as
    /// [`from_json`](Self::from_json).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Replace the partition parameters
    #[must_use]
    pub fn with_partition(mut self, partition: PartitionConfig) -> Self {
        self.partition = partition;
        self
    }
}

/// One execution request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Valuation instant
    pub at: Timestamp,
    /// Root input values
    pub inputs: BTreeMap<ValueId, serde_json::Value>,
}

impl ExecutionRequest {
    /// Request at `at` with no inputs yet
    #[must_use]
    pub fn new(at: Timestamp) -> Self {
        Self {
            at,
            inputs: BTreeMap::new(),
        }
    }

    /// Add a root input
    #[must_use]
    pub fn with_input(mut self, value: impl Into<ValueId>, payload: serde_json::Value) -> Self {
        self.inputs.insert(value.into(), payload);
        self
    }
}

/// Runs execution requests against one plan
pub struct ExecutionEngine {
    plan: Arc<ExecutionPlan>,
    cache: CompilationCache,
    backend: Arc<dyn DispatchBackend>,
    factory: Arc<JobSpecificationFactory>,
    metrics: Arc<ExecutionMetrics>,
    config: EngineConfig,
}

impl ExecutionEngine {
    /// Plan `graph` and build an engine for it
    ///
    /// # Errors
    ///
    /// Returns any planning error.
    pub fn new(
        graph: Arc<Graph>,
        functions: FunctionRepository,
        backend: Arc<dyn DispatchBackend>,
        config: EngineConfig,
    ) -> Result<Self, PlanError> {
        let plan = ExecutionPlan::build(graph, config.partition)?;
        Ok(Self::from_plan(Arc::new(plan), functions, backend, config))
    }

    /// Build an engine around an existing plan
    #[must_use]
    pub fn from_plan(
        plan: Arc<ExecutionPlan>,
        functions: FunctionRepository,
        backend: Arc<dyn DispatchBackend>,
        config: EngineConfig,
    ) -> Self {
        let cache = CompilationCache::new(
            Arc::clone(plan.graph()),
            Arc::new(functions),
            config.cache.clone(),
        );
        let factory = JobSpecificationFactory::new(ProcessId::new(), config.configuration_name.clone());
        Self {
            plan,
            cache,
            backend,
            factory: Arc::new(factory),
            metrics: Arc::new(ExecutionMetrics::new()),
            config,
        }
    }

    /// Start executing a request
    ///
    /// The returned future resolves once every fragment settled, or
    /// immediately with `MissingRootInputs` if the request does not supply
    /// every root input of the graph.
    pub fn execute(&self, request: ExecutionRequest) -> RootFuture {
        self.metrics.record_request();
        let graph = self.plan.graph();

        let missing: Vec<ValueId> = graph
            .root_inputs()
            .iter()
            .filter(|value| !request.inputs.contains_key(*value))
            .cloned()
            .collect();
        if !missing.is_empty() {
            tracing::warn!(graph = graph.name(), ?missing, "request is missing root inputs");
            return RootFuture::failed(ExecutionError::MissingRootInputs { values: missing });
        }

        let compiled = self.cache.compile(request.at);
        tracing::debug!(
            graph = graph.name(),
            at = %request.at,
            failures = compiled.failures().len(),
            "compiled graph for request"
        );

        aggregator::start(Launch {
            plan: Arc::clone(&self.plan),
            backend: Arc::clone(&self.backend),
            factory: Arc::clone(&self.factory),
            compiled,
            values: Arc::new(SharedValueCache::with_values(request.inputs)),
            at: request.at,
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Plan being executed
    #[must_use]
    pub fn plan(&self) -> &Arc<ExecutionPlan> {
        &self.plan
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compilation cache
    #[must_use]
    pub fn compilation_cache(&self) -> &CompilationCache {
        &self.cache
    }

    /// Compilation cache counters
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Execution counters
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("graph", &self.plan.graph().name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::FragmentState;
    use crate::backend::NullBackend;
    use crate::inprocess::InProcessBackend;
    use crate::job::JobFailure;
    use calcgrid_compile::{
        CompileError, CompiledFunction, FunctionInputs, InvocationError,
    };
    use calcgrid_core::{ComputedValue, ValueRequirement};
    use calcgrid_graph::{GraphBuilder, sample};
    use calcgrid_plan::FragmentId;
    use serde_json::json;
    use std::io::Write;

    fn seed(inputs: &FunctionInputs) -> Result<Vec<ComputedValue>, InvocationError> {
        Ok(inputs
            .outputs()
            .iter()
            .map(|out| ComputedValue::new(out.clone(), json!(1.0)))
            .collect())
    }

    fn sum(inputs: &FunctionInputs) -> Result<Vec<ComputedValue>, InvocationError> {
        let mut total = 0.0;
        for (value, payload) in inputs.values() {
            total += payload.as_f64().ok_or_else(|| InvocationError::InvalidInput {
                value: value.clone(),
                reason: "not a number".to_string(),
            })?;
        }
        Ok(inputs
            .outputs()
            .iter()
            .map(|out| ComputedValue::new(out.clone(), json!(total)))
            .collect())
    }

    fn functions() -> FunctionRepository {
        let mut repo = FunctionRepository::new();
        repo.register(
            "seed",
            Arc::new(|_at: Timestamp| -> Result<CompiledFunction, CompileError> {
                Ok(CompiledFunction::unbounded(Arc::new(seed)))
            }),
        );
        repo.register(
            "sum",
            Arc::new(|_at: Timestamp| -> Result<CompiledFunction, CompileError> {
                Ok(CompiledFunction::unbounded(Arc::new(sum)))
            }),
        );
        repo
    }

    fn requirement(name: &str) -> ValueRequirement {
        ValueRequirement::from(name)
    }

    #[tokio::test]
    async fn test_fan_out_values() {
        for partition in [
            PartitionConfig::identity(),
            PartitionConfig::new(2, Some(2)),
            PartitionConfig::new(5, None),
        ] {
            let engine = ExecutionEngine::new(
                Arc::new(sample::fan_out_graph()),
                functions(),
                Arc::new(InProcessBackend::current().unwrap()),
                EngineConfig::default().with_partition(partition),
            )
            .unwrap();

            let results = engine
                .execute(ExecutionRequest::new(Timestamp::new(10, 0)))
                .await
                .unwrap();
            assert_eq!(results.value(&requirement("R0")), Some(&json!(1.0)));
            assert_eq!(results.value(&requirement("R1")), Some(&json!(1.0)));
            assert_eq!(results.value(&requirement("R4")), Some(&json!(2.0)));
            assert_eq!(engine.metrics().jobs_failed, 0);
        }
    }

    #[tokio::test]
    async fn test_root_inputs_seed_shared_cache() {
        let mut b = GraphBuilder::new("book");
        b.declare_root_input("spot");
        b.add_node("sum", ["spot"], ["pv"]);
        b.add_node("sum", ["pv", "spot"], ["total"]);
        b.add_terminal_output("PV", "pv");
        b.add_terminal_output("TOTAL", "total");
        let engine = ExecutionEngine::new(
            Arc::new(b.build().unwrap()),
            functions(),
            Arc::new(InProcessBackend::current().unwrap()),
            EngineConfig::default(),
        )
        .unwrap();

        let request = ExecutionRequest::new(Timestamp::new(5, 0)).with_input("spot", json!(100.0));
        let results = engine.execute(request).await.unwrap();
        assert_eq!(results.value(&requirement("PV")), Some(&json!(100.0)));
        assert_eq!(results.value(&requirement("TOTAL")), Some(&json!(200.0)));
    }

    #[tokio::test]
    async fn test_missing_root_inputs_fail_fast() {
        let mut b = GraphBuilder::new("book");
        b.declare_root_input("spot");
        b.add_node("sum", ["spot"], ["pv"]);
        b.add_terminal_output("PV", "pv");
        let backend = Arc::new(NullBackend::immediate());
        let engine = ExecutionEngine::new(
            Arc::new(b.build().unwrap()),
            functions(),
            Arc::clone(&backend) as Arc<dyn DispatchBackend>,
            EngineConfig::default(),
        )
        .unwrap();

        let err = engine
            .execute(ExecutionRequest::new(Timestamp::EPOCH))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ExecutionError::MissingRootInputs {
                values: vec![ValueId::from("spot")]
            }
        );
        assert!(backend.dispatched().is_empty());
    }

    #[tokio::test]
    async fn test_invocation_failure_is_isolated() {
        let mut repo = functions();
        repo.register(
            "broken",
            Arc::new(|_at: Timestamp| -> Result<CompiledFunction, CompileError> {
                Ok(CompiledFunction::unbounded(Arc::new(
                    |_: &FunctionInputs| -> Result<Vec<ComputedValue>, InvocationError> {
                        Err(InvocationError::Failed("no curve".to_string()))
                    },
                )))
            }),
        );

        let mut b = GraphBuilder::new("mixed");
        b.add_node("seed", Vec::<&str>::new(), ["a"]);
        b.add_node("broken", ["a"], ["b"]);
        b.add_node("sum", ["b"], ["c"]);
        b.add_node("sum", ["a"], ["d"]);
        b.add_terminal_output("C", "c");
        b.add_terminal_output("D", "d");

        let engine = ExecutionEngine::new(
            Arc::new(b.build().unwrap()),
            repo,
            Arc::new(InProcessBackend::current().unwrap()),
            EngineConfig::default().with_partition(PartitionConfig::identity()),
        )
        .unwrap();

        let Err(ExecutionError::FragmentsFailed { failures, partial }) =
            engine.execute(ExecutionRequest::new(Timestamp::EPOCH)).await
        else {
            panic!("expected failure");
        };
        assert!(matches!(
            failures.get(&FragmentId::from_raw(1)),
            Some(JobFailure::Invocation { .. })
        ));
        assert_eq!(partial.states[&FragmentId::from_raw(2)], FragmentState::Cancelled);
        assert_eq!(partial.value(&requirement("D")), Some(&json!(1.0)));
        assert!(partial.value(&requirement("C")).is_none());
        assert_eq!(engine.metrics().jobs_failed, 1);
    }

    #[tokio::test]
    async fn test_compile_failure_fails_owning_fragment() {
        let mut repo = functions();
        repo.register(
            "sum",
            Arc::new(|_at: Timestamp| -> Result<CompiledFunction, CompileError> {
                Err(CompileError::Failed {
                    function: "sum".into(),
                    reason: "no market data".to_string(),
                })
            }),
        );
        let backend = Arc::new(NullBackend::immediate());
        let engine = ExecutionEngine::new(
            Arc::new(sample::fan_out_graph()),
            repo,
            Arc::clone(&backend) as Arc<dyn DispatchBackend>,
            EngineConfig::default().with_partition(PartitionConfig::identity()),
        )
        .unwrap();

        let Err(ExecutionError::FragmentsFailed { failures, partial }) =
            engine.execute(ExecutionRequest::new(Timestamp::EPOCH)).await
        else {
            panic!("expected failure");
        };
        // every sum node fails; seeds still run
        assert_eq!(
            failures.keys().copied().collect::<Vec<_>>(),
            vec![FragmentId::from_raw(0), FragmentId::from_raw(1), FragmentId::from_raw(4)]
        );
        assert_eq!(backend.dispatched(), vec![FragmentId::from_raw(2), FragmentId::from_raw(3)]);
        assert_eq!(partial.states[&FragmentId::from_raw(2)], FragmentState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_noop() {
        let engine = ExecutionEngine::new(
            Arc::new(sample::chains_graph()),
            functions(),
            Arc::new(NullBackend::immediate()),
            EngineConfig::default(),
        )
        .unwrap();
        let future = engine.execute(ExecutionRequest::new(Timestamp::EPOCH));
        let handle = future.handle();
        assert!(future.await.is_ok());
        assert!(!handle.cancel());
        assert!(
            handle
                .fragment_states()
                .values()
                .all(|s| *s == FragmentState::Completed)
        );
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let backend = Arc::new(NullBackend::never());
        let engine = ExecutionEngine::new(
            Arc::new(sample::fan_out_graph()),
            functions(),
            Arc::clone(&backend) as Arc<dyn DispatchBackend>,
            EngineConfig::default().with_partition(PartitionConfig::identity()),
        )
        .unwrap();
        let future = engine.execute(ExecutionRequest::new(Timestamp::EPOCH));
        let handle = future.handle();

        assert!(handle.cancel());
        assert_eq!(backend.cancelled(), 2);
        assert_eq!(future.await, Err(ExecutionError::Cancelled));
        assert_eq!(engine.metrics().jobs_cancelled, 5);
    }

    #[tokio::test]
    async fn test_requests_reuse_compilations() {
        let engine = ExecutionEngine::new(
            Arc::new(sample::fan_out_graph()),
            functions(),
            Arc::new(NullBackend::immediate()),
            EngineConfig::default(),
        )
        .unwrap();
        engine.execute(ExecutionRequest::new(Timestamp::new(1, 0))).await.unwrap();
        engine.execute(ExecutionRequest::new(Timestamp::new(2, 0))).await.unwrap();

        let stats = engine.cache_stats();
        assert_eq!(stats.compilations, 5);
        assert_eq!(stats.reused, 5);
        assert_eq!(engine.metrics().requests, 2);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"configuration_name": "eod", "partition": {{"min_fragment_size": 2, "max_fragment_size": 4, "concurrency_limit": null}}}}"#
        )
        .unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.configuration_name, "eod");
        assert_eq!(config.partition, PartitionConfig::new(2, Some(4)));
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_config_rejects_inconsistent_partition() {
        let err = EngineConfig::from_json(
            r#"{"partition": {"min_fragment_size": 3, "max_fragment_size": 2}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(PlanError::InvalidConfig { .. })));

        let err = EngineConfig::from_json_file("/nonexistent/calcgrid.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
