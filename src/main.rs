//! ddbctl CLI
//!
//! Deletes every item of a DynamoDB partition.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::format::{Format, Json, JsonFields};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ddbctl::config::LoggingConfig;
use ddbctl::{
    build_runtime, run_analysis, run_deletion, Config, DeletionRequest, LogFormat, RequestContext,
};

#[derive(Parser)]
#[command(name = "ddbctl")]
#[command(about = "Bulk-delete DynamoDB partitions", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

/// Table and partition to operate on, plus connection overrides.
#[derive(Args, Debug)]
struct TargetArgs {
    /// Table name
    #[arg(short = 't', long)]
    table_name: String,

    /// Partition key value
    #[arg(short = 'p', long)]
    partition_value: String,

    /// Endpoint override, e.g. http://localhost:8000 for DynamoDB Local
    #[arg(short = 'e', long)]
    endpoint_url: Option<String>,

    /// AWS region
    #[arg(short = 'r', long)]
    region: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete every item of a partition
    DeletePartition {
        #[command(flatten)]
        target: TargetArgs,

        /// Skip the confirmation prompt
        #[arg(short = 's', long)]
        skip_confirmation: bool,

        /// Items per query page
        #[arg(long)]
        page_size: Option<u32>,
    },

    /// Count what a deletion would touch without deleting anything
    Analyze {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "ddbctl.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::DeletePartition {
            target,
            skip_confirmation,
            page_size,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            apply_overrides(&mut config, &target, page_size);
            init_logging(&config.logging, cli.log_format)?;
            delete_partition_command(config, target, skip_confirmation)?;
        }

        Commands::Analyze { target } => {
            let mut config = load_config(cli.config.as_deref())?;
            apply_overrides(&mut config, &target, None);
            init_logging(&config.logging, cli.log_format)?;
            analyze_command(config, target)?;
        }

        Commands::Validate => {
            validate_command(cli.config.as_deref())?;
        }

        Commands::GenerateConfig { output } => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn init_logging(config: &LoggingConfig, format_override: Option<LogFormat>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log level `{}`", config.level))?;
    let registry = tracing_subscriber::registry().with(filter);

    match format_override.unwrap_or(config.format) {
        LogFormat::Json => registry.with(json_layer(std::io::stdout)).try_init()?,
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init()?,
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init()?,
    }
    Ok(())
}

/// JSON lines carrying every enclosing span, so events of the worker spans
/// keep the `request_id` recorded on the request span.
fn json_layer<S, W>(writer: W) -> fmt::Layer<S, JsonFields, Format<Json>, W>
where
    W: for<'w> MakeWriter<'w> + 'static,
{
    fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(writer)
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn apply_overrides(config: &mut Config, target: &TargetArgs, page_size: Option<u32>) {
    if let Some(endpoint) = &target.endpoint_url {
        config.aws.endpoint_url = Some(endpoint.clone());
    }
    if let Some(region) = &target.region {
        config.aws.region = region.clone();
    }
    if page_size.is_some() {
        config.pipeline.page_size = page_size;
    }
}

fn delete_partition_command(config: Config, target: TargetArgs, skip_confirmation: bool) -> Result<()> {
    if !skip_confirmation && !confirm(&target)? {
        println!("Aborted, nothing was deleted");
        return Ok(());
    }

    let request = DeletionRequest::new(target.table_name, target.partition_value);
    let runtime = build_runtime(config.runtime.worker_threads)?;
    let summary = runtime.block_on(async {
        let ctx = RequestContext::new();
        watch_for_interrupt(&ctx);
        run_deletion(&config, &request, &ctx).await
    })?;

    println!("{summary}");
    Ok(())
}

fn analyze_command(config: Config, target: TargetArgs) -> Result<()> {
    let request = DeletionRequest::new(target.table_name, target.partition_value);
    let runtime = build_runtime(config.runtime.worker_threads)?;
    let analysis = runtime.block_on(async {
        let ctx = RequestContext::new();
        watch_for_interrupt(&ctx);
        run_analysis(&config, &request, &ctx).await
    })?;

    println!("\n=== Partition Analysis ===");
    println!("Table: {}", analysis.key_schema.table_name);
    println!("Partition key: {}", analysis.key_schema.partition_key);
    println!(
        "Sort key: {}",
        analysis.key_schema.range_key.as_deref().unwrap_or("<none>")
    );
    println!("Partition value: {}", analysis.partition_value);
    println!("Pages: {}", analysis.pages);
    println!("Items: {}", analysis.items);
    println!("Delete batches: {}", analysis.batches);
    println!("Read capacity consumed: {:.1} RCU", analysis.read_capacity_units);
    println!("==========================\n");

    Ok(())
}

/// Cancel `ctx` on Ctrl-C. In-flight calls finish; nothing new is issued.
fn watch_for_interrupt(ctx: &RequestContext) {
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling request");
            cancel.cancel();
        }
    });
}

fn confirm(target: &TargetArgs) -> Result<bool> {
    print!(
        "Delete all items with partition key value `{}` from table `{}`? [y/N]: ",
        target.partition_value, target.table_name
    );
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(is_confirmation(&answer))
}

fn is_confirmation(answer: &str) -> bool {
    matches!(answer.trim(), "y" | "Y")
}

fn validate_command(config_path: Option<&Path>) -> Result<()> {
    let path = config_path.context("No configuration file given, pass --config")?;
    let config = load_config(Some(path))?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    let yaml = r#"# ddbctl configuration

# === AWS: DynamoDB connection settings ===
aws:
  region: "us-east-1"

  # Custom endpoint (DynamoDB Local, LocalStack, ...)
  # endpoint_url: "http://localhost:8000"

  # Fixed credentials instead of the default provider chain.
  # DynamoDB Local accepts any non-empty pair.
  # static_credentials:
  #   access_key_id: "local"
  #   secret_access_key: "local"

# === PIPELINE: Conduit sizing and paging ===
pipeline:
  # Capacity of the batch-request conduit (page splitters -> executor)
  request_buffer: 2

  # Capacity of the batch-result conduit (executor -> aggregator)
  result_buffer: 2

  # Items per query page (unset = store default, up to 1 MB per page)
  # page_size: 500

# === RUNTIME ===
runtime:
  # Tokio worker threads (null = num CPUs)
  worker_threads: null

# === LOGGING ===
logging:
  # Filter directive, overridden by RUST_LOG
  level: "info"

  # json, pretty or compact
  format: "json"

# Optional path to save metrics JSON after a run completes
# metrics_output_path: "ddbctl-metrics.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
