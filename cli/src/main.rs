use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use tidewater_kernel::compute::{ComputeRequest, ComputeResponse};
use tidewater_kernel::config::PushJobConfig;
use tidewater_kernel::schema::{AvroStyleCompatibility, RecordSchema};
use tidewater_kernel::simulate::{PushSimulation, PushSummary, SimulationSettings};
use tidewater_kernel::source::SourceAdapter;

mod logging;

use logging::LoggingLevel;

/// Tidewater bulk push CLI
#[derive(Parser, Debug)]
#[command(name = "tidewater")]
#[command(about = "Bulk-load key-value versions and compute over them", long_about = None)]
struct Cli {
    /// Log verbosity: -v for info, -vv for debug
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to push job config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a source directory and print its schema and size
    Validate {
        #[arg(long)]
        source: PathBuf,

        /// Value schema already registered for the store (repeatable)
        #[arg(long = "existing-schema")]
        existing_schema: Vec<PathBuf>,
    },

    /// Push a source through the in-memory pipeline and compute over it
    Simulate {
        #[arg(long)]
        source: PathBuf,

        #[arg(long)]
        store: String,

        #[arg(long, default_value_t = 4)]
        partitions: u32,

        /// Replicas per datacenter
        #[arg(long, default_value_t = 3)]
        replicas: u32,

        /// Required datacenter (repeatable)
        #[arg(long = "datacenter", default_value = "dc-0")]
        datacenters: Vec<String>,

        /// Compute request JSON, inline or @file (repeatable)
        #[arg(long = "compute")]
        compute: Vec<String>,

        /// Key to compute over, as JSON (repeatable)
        #[arg(long = "key")]
        keys: Vec<String>,
    },
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct SimulateOutput {
    push: PushSummary,
    compute: Vec<ComputeResponse>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    LoggingLevel::new(cli.verbose).setup_logging();

    let config = match &cli.config {
        Some(path) => PushJobConfig::load(path)?,
        None => PushJobConfig::default(),
    };

    match cli.command {
        Command::Validate {
            source,
            existing_schema,
        } => {
            let existing = existing_schema
                .iter()
                .map(|path| {
                    let json = fs::read_to_string(path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    let schema = RecordSchema::parse(&json)
                        .with_context(|| format!("parsing {}", path.display()))?;
                    Ok(Arc::new(schema))
                })
                .collect::<Result<Vec<_>>>()?;

            let adapter = SourceAdapter::new(config.source, Arc::new(AvroStyleCompatibility));
            let info = adapter.validate(&source, &existing)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Simulate {
            source,
            store,
            partitions,
            replicas,
            datacenters,
            compute,
            keys,
        } => {
            let requests = compute
                .iter()
                .map(String::as_str)
                .map(parse_request)
                .collect::<Result<Vec<_>>>()?;
            let keys = keys
                .iter()
                .map(|k| {
                    serde_json::from_str::<serde_json::Value>(k)
                        .with_context(|| format!("key `{k}` is not JSON"))
                })
                .collect::<Result<Vec<_>>>()?;

            let settings = SimulationSettings {
                store,
                partitions,
                replicas_per_datacenter: replicas,
                datacenters,
            };
            let simulation = PushSimulation::new(settings, config)?;
            let push = simulation.push(&source)?;
            let compute = requests
                .iter()
                .map(|request| simulation.compute(&keys, request))
                .collect::<Result<Vec<_>, _>>()?;

            let output = SimulateOutput { push, compute };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn parse_request(arg: &str) -> Result<ComputeRequest> {
    let json = match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).with_context(|| format!("reading {path}"))?,
        None => arg.to_string(),
    };
    let request: ComputeRequest =
        serde_json::from_str(&json).context("invalid compute request")?;
    request.validate()?;
    Ok(request)
}
