//! Subcommand implementations.
//!
//! Each command returns the text to print so the binary's `main` stays a
//! thin dispatcher.

use crate::functions;
use calcgrid_cluster::{PoolConfig, WorkerPool};
use calcgrid_compile::CacheStats;
use calcgrid_core::{FunctionId, Timestamp, ValueId, ValueRequirement};
use calcgrid_graph::{Graph, GraphDefinition, sample};
use calcgrid_plan::{ExecutionPlan, FragmentId, PartitionConfig};
use calcgrid_runtime::{
    DispatchBackend, EngineConfig, ExecutionEngine, ExecutionError, ExecutionRequest,
    FragmentState, InProcessBackend, MetricsSnapshot,
};
use clap::{Args, ValueEnum};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Where a command reads its graph from
#[derive(Debug, Clone, Default, Args)]
pub struct GraphSource {
    /// Path to a JSON graph definition
    pub graph: Option<PathBuf>,
    /// Use a built-in sample graph instead of a file
    #[arg(long, conflicts_with = "graph")]
    pub sample: Option<String>,
}

impl GraphSource {
    /// Load and validate the graph
    pub fn load(&self) -> Result<Graph> {
        match (&self.graph, &self.sample) {
            (Some(path), _) => {
                let text = std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("reading graph {}", path.display()))?;
                let graph = GraphDefinition::from_json(&text)?.into_graph()?;
                Ok(graph)
            }
            (None, Some(name)) => sample_graph(name),
            (None, None) => bail!("no graph given; pass a file or --sample <name>"),
        }
    }
}

/// Partition flags that override the configuration file
#[derive(Debug, Clone, Default, Args)]
pub struct PartitionFlags {
    /// Minimum fragment size
    #[arg(long)]
    pub min: Option<usize>,
    /// Maximum fragment size
    #[arg(long)]
    pub max: Option<usize>,
    /// Fragments per execution lane
    #[arg(long)]
    pub concurrency: Option<usize>,
}

impl PartitionFlags {
    /// Apply the flags on top of `base`
    #[must_use]
    pub fn apply(&self, mut base: PartitionConfig) -> PartitionConfig {
        if let Some(min) = self.min {
            base.min_fragment_size = min;
        }
        if let Some(max) = self.max {
            base.max_fragment_size = Some(max);
        }
        if let Some(limit) = self.concurrency {
            base.concurrency_limit = Some(limit);
        }
        base
    }
}

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human readable
    #[default]
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Dispatch backend used by `run`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Blocking thread pool of this process
    #[default]
    Inprocess,
    /// Worker pool behind the remote transport
    Pool,
}

/// Options of the `run` command
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Engine configuration file
    pub config: Option<PathBuf>,
    /// Partition overrides
    pub partition: PartitionFlags,
    /// Root input values
    pub inputs: Vec<(ValueId, serde_json::Value)>,
    /// Valuation instant (RFC 3339), now if absent
    pub at: Option<String>,
    /// Dispatch backend
    pub backend: Backend,
    /// Worker count for the pool backend
    pub workers: usize,
}

/// Printable outcome of `run`
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Graph label
    pub graph: String,
    /// Valuation instant
    pub at: String,
    /// Terminal values by requirement
    pub values: BTreeMap<ValueRequirement, serde_json::Value>,
    /// Final state of every fragment
    pub states: BTreeMap<FragmentId, FragmentState>,
    /// Failure message of every failed fragment
    pub failures: BTreeMap<FragmentId, String>,
    /// Execution counters
    pub metrics: MetricsSnapshot,
    /// Compilation cache counters
    pub cache: CacheStats,
}

fn sample_graph(name: &str) -> Result<Graph> {
    sample::by_name(name).ok_or_else(|| {
        eyre!(
            "unknown sample {name:?}; available: {}",
            sample::NAMES.join(", ")
        )
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Parse `name=value`; the value is read as JSON, or as a string if it is
/// not valid JSON
pub fn parse_input(text: &str) -> Result<(ValueId, serde_json::Value), String> {
    let (name, raw) = text
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {text:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty value name in {text:?}"));
    }
    let payload = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((ValueId::from(name), payload))
}

/// `calcgrid sample`: print a sample graph definition
pub fn sample(name: &str) -> Result<String> {
    let graph = sample_graph(name)?;
    Ok(GraphDefinition::from(&graph).to_json()?)
}

/// `calcgrid validate`: check a graph and summarize it
pub fn validate(source: &GraphSource) -> Result<String> {
    let graph = source.load()?;
    let unknown: Vec<&FunctionId> = graph
        .functions()
        .into_iter()
        .filter(|f| !functions::BUILTINS.contains(&f.as_str()))
        .collect();

    let mut out = format!(
        "{}: {} nodes, {} root inputs, {} terminal outputs",
        graph.name(),
        graph.len(),
        graph.root_inputs().len(),
        graph.terminal_outputs().len()
    );
    if !unknown.is_empty() {
        let names: Vec<&str> = unknown.iter().map(|f| f.as_str()).collect();
        tracing::warn!(?names, "graph uses functions without a built-in definition");
        out.push_str(&format!("\nno built-in definition for: {}", names.join(", ")));
    }
    Ok(out)
}

/// `calcgrid partition`: plan a graph and print the fragment layout
pub fn partition(
    source: &GraphSource,
    config: Option<&PathBuf>,
    flags: &PartitionFlags,
    format: Format,
) -> Result<String> {
    let graph = source.load()?;
    let base = match config {
        Some(path) => EngineConfig::from_json_file(path)?.partition,
        None => PartitionConfig::default(),
    };
    let plan = ExecutionPlan::build(Arc::new(graph), flags.apply(base))?;
    let report = plan.report();
    match format {
        Format::Text => Ok(report.to_string()),
        Format::Json => to_json(&report),
    }
}

/// `calcgrid run`: execute a graph once with the built-in functions
pub async fn run(source: &GraphSource, options: &RunOptions) -> Result<RunReport> {
    let graph = Arc::new(source.load()?);
    let mut config = match &options.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    config.partition = options.partition.apply(config.partition);

    let at = match &options.at {
        Some(text) => Timestamp::parse_rfc3339(text)?,
        None => Timestamp::now(),
    };
    let request = options
        .inputs
        .iter()
        .fold(ExecutionRequest::new(at), |request, (value, payload)| {
            request.with_input(value.clone(), payload.clone())
        });

    let pool = match options.backend {
        Backend::Inprocess => None,
        Backend::Pool => Some(Arc::new(WorkerPool::new(&PoolConfig::new(options.workers))?)),
    };
    let backend: Arc<dyn DispatchBackend> = match &pool {
        Some(pool) => Arc::clone(pool) as Arc<dyn DispatchBackend>,
        None => Arc::new(InProcessBackend::current()?),
    };

    let engine = ExecutionEngine::new(
        Arc::clone(&graph),
        functions::builtin_repository(),
        backend,
        config,
    )?;
    tracing::info!(
        graph = graph.name(),
        fragments = engine.plan().tree().len(),
        backend = ?options.backend,
        "running graph"
    );

    let outcome = engine.execute(request).await;
    if let Some(pool) = &pool {
        pool.shutdown().await;
    }

    let (results, failures) = match outcome {
        Ok(results) => (results, BTreeMap::new()),
        Err(ExecutionError::FragmentsFailed { failures, partial }) => {
            let failures = failures
                .into_iter()
                .map(|(fragment, failure)| (fragment, failure.to_string()))
                .collect();
            (partial, failures)
        }
        Err(err) => return Err(err.into()),
    };

    Ok(RunReport {
        graph: graph.name().to_string(),
        at: at.to_rfc3339(),
        values: results.values,
        states: results.states,
        failures,
        metrics: engine.metrics(),
        cache: engine.cache_stats(),
    })
}

/// Render a run report
pub fn render(report: &RunReport, format: Format) -> Result<String> {
    if format == Format::Json {
        return to_json(report);
    }
    let mut out = format!(
        "{} at {}: {} jobs completed, {} failed",
        report.graph, report.at, report.metrics.jobs_completed, report.metrics.jobs_failed
    );
    for (requirement, value) in &report.values {
        out.push_str(&format!("\n  {requirement} = {value}"));
    }
    for (fragment, failure) in &report.failures {
        out.push_str(&format!("\n  {fragment} failed: {failure}"));
    }
    Ok(out)
}
