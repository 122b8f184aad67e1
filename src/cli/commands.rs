//! CLI command definitions for config-refinery.
//!
//! `run` refines one configuration synchronously; `batch` pushes several
//! through the queue manager and reports every terminal notification.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cancellation::{CancellationManager, CancellationManagerHandle};
use crate::config::ServiceConfig;
use crate::domain::DomainConfig;
use crate::metrics;
use crate::pipeline::{Collaborators, PipelineCoordinator, RefinementResult, RunOptions};
use crate::scheduler::{JobNotification, Priority, QueueManager, QueueStats, SubmitOptions};

/// Iterative refinement of domain configurations.
#[derive(Parser)]
#[command(name = "config-refinery")]
#[command(about = "Iteratively refine domain configurations until they meet a quality bar")]
#[command(version)]
#[command(
    long_about = "config-refinery scores a domain configuration, applies feedback and validates each refinement until a quality threshold, iteration cap, timeout or stagnation stops it.\n\nExample usage:\n  config-refinery run --input billing.json --max-iterations 3\n  config-refinery batch --input a.json --input b.yaml --priority high"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML service configuration. Environment variables override it.
    #[arg(short, long, env = "REFINERY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Print Prometheus metrics before exiting.
    #[arg(long, global = true)]
    pub metrics: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Refine a single configuration and print the result.
    Run(RunArgs),

    /// Refine several configurations through the job queue.
    Batch(BatchArgs),
}

/// Arguments for `config-refinery run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Configuration file (JSON or YAML).
    #[arg(short, long)]
    pub input: PathBuf,

    /// Iteration cap (1-5).
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Quality score at which refinement stops (0.0-1.0).
    #[arg(long)]
    pub quality_threshold: Option<f64>,

    /// Time budget in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Output the full result as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `config-refinery batch`.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// Configuration files (JSON or YAML). Repeat for several.
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<PathBuf>,

    /// Priority for every job (low, normal, high, urgent).
    #[arg(short, long, default_value = "normal")]
    pub priority: String,

    /// Override the concurrency limit.
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Output notifications as JSON lines.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if cli.metrics {
        metrics::init_metrics().context("Failed to initialize metrics")?;
    }

    let config = ServiceConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Run(args) => run_single(args, config).await?,
        Commands::Batch(args) => run_batch(args, config).await?,
    }

    if cli.metrics {
        print!("{}", metrics::export_metrics());
    }
    Ok(())
}

/// Reads a configuration file. `.yaml`/`.yml` files are parsed as YAML, anything else as JSON.
pub fn read_payload(path: &Path) -> anyhow::Result<DomainConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
    let value: serde_json::Value = if is_yaml {
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Invalid YAML in {}", path.display()))?
    } else {
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?
    };

    DomainConfig::from_value(value).with_context(|| format!("Invalid payload in {}", path.display()))
}

fn build_coordinator(config: &ServiceConfig, cancellation: CancellationManagerHandle) -> PipelineCoordinator {
    PipelineCoordinator::new(Collaborators::baseline(), config.pipeline.clone())
        .with_required_keys(config.queue.required_keys.clone())
        .with_cancellation(cancellation)
}

async fn run_single(args: RunArgs, config: ServiceConfig) -> anyhow::Result<()> {
    let payload = read_payload(&args.input)?;
    let cancellation = CancellationManager::spawn(config.cancellation.clone())?;
    let coordinator = build_coordinator(&config, cancellation.clone());

    let options = RunOptions {
        max_iterations: args.max_iterations,
        quality_threshold: args.quality_threshold,
        timeout: args.timeout_ms.map(Duration::from_millis),
        ..Default::default()
    };

    info!(input = %args.input.display(), "Refining configuration");
    let outcome = coordinator.run(payload, &options).await;
    if let Err(e) = cancellation.shutdown().await {
        warn!(error = %e, "Cancellation manager did not shut down cleanly");
    }
    let result = outcome?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result)?;
    }
    Ok(())
}

fn print_result(result: &RefinementResult) -> anyhow::Result<()> {
    println!("\n=== Refinement Result ===");
    println!("Termination:   {}", result.termination_reason);
    println!("Iterations:    {}", result.iteration_count);
    println!(
        "Quality:       {:.3} -> {:.3} ({:+.3})",
        result.original_quality.overall, result.final_quality.overall, result.quality_delta
    );
    println!("Elapsed:       {} ms", result.elapsed.as_millis());
    if !result.top_improved_dimensions.is_empty() {
        println!("Top improved:  {}", result.top_improved_dimensions.join(", "));
    }
    println!("\nFinal configuration:");
    println!("{}", serde_json::to_string_pretty(&result.final_config)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct BatchSummary {
    submitted: usize,
    rejected: usize,
    stats: QueueStats,
}

async fn run_batch(args: BatchArgs, mut config: ServiceConfig) -> anyhow::Result<()> {
    let priority: Priority = args.priority.parse()?;
    if let Some(max_concurrent) = args.max_concurrent {
        config.queue.max_concurrent = max_concurrent;
        config.queue.validate()?;
    }

    let cancellation = CancellationManager::spawn(config.cancellation.clone())?;
    let coordinator = build_coordinator(&config, cancellation.clone());
    let queue = QueueManager::spawn(config.queue.clone(), coordinator)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut submitted = 0usize;
    let mut rejected = 0usize;
    for path in &args.input {
        let payload = match read_payload(path) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(input = %path.display(), error = %e, "Skipping input");
                rejected += 1;
                continue;
            }
        };
        let options = SubmitOptions::new()
            .with_priority(priority)
            .with_callback(tx.clone());
        match queue.submit(payload, options).await {
            Ok(job_id) => {
                info!(job_id = %job_id, input = %path.display(), "Submitted");
                submitted += 1;
            }
            Err(e) => {
                warn!(input = %path.display(), error = %e, "Submission rejected");
                rejected += 1;
            }
        }
    }
    drop(tx);

    let mut received = 0usize;
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    while received < submitted {
        tokio::select! {
            notification = rx.recv() => {
                let Some(notification) = notification else { break };
                received += 1;
                print_notification(&notification, args.json)?;
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                warn!("Interrupted, cancelling remaining jobs");
                queue.shutdown().await?;
            }
        }
    }

    let summary = BatchSummary {
        submitted,
        rejected,
        stats: queue.stats().await?,
    };
    queue.shutdown().await?;
    cancellation.shutdown().await?;

    if args.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        println!("\n=== Batch Summary ===");
        println!("Submitted:     {}", summary.submitted);
        println!("Rejected:      {}", summary.rejected);
        println!("Completed:     {}", summary.stats.completed);
        println!("Failed:        {}", summary.stats.failed);
        println!("Cancelled:     {}", summary.stats.cancelled);
        println!("Success rate:  {:.1}%", summary.stats.success_rate());
    }
    Ok(())
}

fn print_notification(notification: &JobNotification, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(notification)?);
        return Ok(());
    }
    match notification {
        JobNotification::Completed { job_id, result } => println!(
            "[completed] {}: {} after {} iterations, quality {:.3}",
            job_id, result.termination_reason, result.iteration_count, result.final_quality.overall
        ),
        JobNotification::Failed { job_id, error } => println!("[failed] {}: {}", job_id, error),
        JobNotification::Cancelled { job_id, reason } => {
            println!("[cancelled] {}: {}", job_id, reason)
        }
    }
    Ok(())
}
