//! calcgrid CLI
//!
//! Inspect, partition and run dependency graphs from the command line.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod commands;
mod functions;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use commands::{Backend, Format, GraphSource, PartitionFlags, RunOptions};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "calcgrid")]
#[command(about = "calcgrid - graph partitioning and execution scheduler", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a built-in sample graph as JSON
    Sample {
        /// Sample name (fan-out, chains)
        name: String,
    },
    /// Check a graph definition
    Validate {
        #[command(flatten)]
        source: GraphSource,
    },
    /// Partition a graph and print the plan
    Partition {
        #[command(flatten)]
        source: GraphSource,
        /// Engine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        flags: PartitionFlags,
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// Run a graph once with the built-in functions
    Run {
        #[command(flatten)]
        source: GraphSource,
        /// Engine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        flags: PartitionFlags,
        /// Root input as name=value (repeatable)
        #[arg(short, long = "input", value_parser = commands::parse_input)]
        inputs: Vec<(calcgrid_core::ValueId, serde_json::Value)>,
        /// Valuation instant (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<String>,
        /// Dispatch backend
        #[arg(long, value_enum, default_value_t = Backend::Inprocess)]
        backend: Backend,
        /// Workers for the pool backend
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("calcgrid=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Sample { name } => {
            println!("{}", commands::sample(&name)?);
            Ok(())
        }
        Commands::Validate { source } => {
            println!("{}", commands::validate(&source)?);
            Ok(())
        }
        Commands::Partition {
            source,
            config,
            flags,
            format,
        } => {
            println!(
                "{}",
                commands::partition(&source, config.as_ref(), &flags, format)?
            );
            Ok(())
        }
        Commands::Run {
            source,
            config,
            flags,
            inputs,
            at,
            backend,
            workers,
            format,
        } => {
            let options = RunOptions {
                config,
                partition: flags,
                inputs,
                at,
                backend,
                workers,
            };
            let report = commands::run(&source, &options).await?;
            println!("{}", commands::render(&report, format)?);
            if report.failures.is_empty() {
                Ok(())
            } else {
                Err(eyre!("{} fragment(s) failed", report.failures.len()))
            }
        }
    }
}
