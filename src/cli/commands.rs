//! CLI command definitions for the batch coordinator.
//!
//! Settings resolve in this order: CLI flags, then `COORDINATOR_*` /
//! `REDIS_URL` environment variables, then defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::metrics::init_metrics;
use crate::scheduler::{
    Coordinator, CoordinatorConfig, JobConfig, MonitorExit, MonitorSettings, ProgressMonitor,
    ProgressSnapshot, RecoveryEngine,
};
use crate::store::{JobKeys, QueueStore, RedisStore};

/// Fault-tolerant coordinator for distributed batch jobs.
#[derive(Parser)]
#[command(name = "batch-coordinator")]
#[command(about = "Partition work into batches, publish them to Redis and see every batch through")]
#[command(version)]
#[command(
    long_about = "batch-coordinator splits a list of work items into batches, publishes them to a Redis task queue and monitors workers until every batch completes.\n\nCrashed or hung workers are detected through heartbeats and their batches are requeued.\n\nExample usage:\n  batch-coordinator run --input-file items.txt --batch-size 50"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Prefix of every Redis key the job uses.
    #[arg(long, global = true)]
    pub key_prefix: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start (or resume) a job and monitor it until completion.
    Run(RunArgs),

    /// Print a JSON snapshot of a job's progress.
    Status(JobArgs),

    /// Run one recovery pass over a job's failed and stalled batches.
    Recover(RecoverArgs),

    /// Rewrite a job's status counters from its queue lengths.
    Reconcile(JobArgs),
}

/// Arguments for `batch-coordinator run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// File with one work item identifier per line.
    #[arg(short = 'i', long, required_unless_present = "resume")]
    pub input_file: Option<PathBuf>,

    /// Job identifier (default: current local time as YYYYMMDDHHMMSS).
    #[arg(short = 'j', long)]
    pub job_id: Option<String>,

    /// Items per batch for a new job.
    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    /// Seconds between progress polls.
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Seconds without a heartbeat before a batch counts as stalled.
    #[arg(long)]
    pub stall_threshold: Option<u64>,

    /// Only resume an existing job; fail if it does not exist.
    #[arg(long, requires = "job_id")]
    pub resume: bool,

    /// Hold a coordinator lock so no second coordinator can monitor the job.
    #[arg(long)]
    pub exclusive: bool,

    /// Coordinator lock TTL in seconds (with --exclusive).
    #[arg(long, requires = "exclusive")]
    pub lease_ttl: Option<u64>,

    /// Write Prometheus metrics to this file after every poll.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

/// Arguments for commands that address an existing job.
#[derive(Parser, Debug)]
pub struct JobArgs {
    /// Job identifier.
    #[arg(short = 'j', long)]
    pub job_id: String,
}

/// Arguments for `batch-coordinator recover`.
#[derive(Parser, Debug)]
pub struct RecoverArgs {
    /// Job identifier.
    #[arg(short = 'j', long)]
    pub job_id: String,

    /// Seconds without a heartbeat before a batch counts as stalled.
    #[arg(long)]
    pub stall_threshold: Option<u64>,
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
    let config = base_config(&cli)?;
    match cli.command {
        Commands::Run(args) => run_job_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Recover(args) => run_recover_command(config, args).await,
        Commands::Reconcile(args) => run_reconcile_command(config, args).await,
    }
}

/// Loads environment configuration and applies the global flags.
fn base_config(cli: &Cli) -> anyhow::Result<CoordinatorConfig> {
    let mut config = CoordinatorConfig::from_env().context("invalid environment configuration")?;
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(prefix) = &cli.key_prefix {
        config = config.with_key_prefix(prefix.clone());
    }
    Ok(config)
}

/// Applies `run` flags on top of the base configuration.
fn apply_run_args(
    mut config: CoordinatorConfig,
    args: &RunArgs,
) -> anyhow::Result<CoordinatorConfig> {
    if let Some(batch_size) = args.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(secs) = args.poll_interval {
        config = config.with_poll_interval(Duration::from_secs(secs));
    }
    if let Some(secs) = args.stall_threshold {
        config = config.with_stall_threshold(Duration::from_secs(secs));
    }
    if args.exclusive {
        let ttl = args
            .lease_ttl
            .map(Duration::from_secs)
            .or(config.coordinator_lease_ttl)
            .unwrap_or(crate::scheduler::config::DEFAULT_LEASE_TTL);
        config = config.with_coordinator_lease(ttl);
    }
    config.validate()?;
    Ok(config)
}

/// Job identifier derived from the current local time.
pub fn default_job_id() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Reads work items from a file: one per line, trimmed, blank lines skipped.
pub fn read_items(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read input file {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

async fn connect(config: &CoordinatorConfig) -> anyhow::Result<Arc<dyn QueueStore>> {
    let store = RedisStore::connect(&config.redis_url, config.retry)
        .await
        .with_context(|| format!("failed to connect to {}", config.redis_url))?;
    Ok(Arc::new(store))
}

/// Resolves on Ctrl-C. If the handler cannot be installed it never resolves.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_job_command(config: CoordinatorConfig, args: RunArgs) -> anyhow::Result<()> {
    let config = apply_run_args(config, &args)?;
    let job_id = args.job_id.clone().unwrap_or_else(default_job_id);

    init_metrics().context("failed to initialize metrics")?;
    let store = connect(&config).await?;

    let mut coordinator = Coordinator::new(store, config, &job_id);
    if let Some(path) = &args.metrics_file {
        coordinator = coordinator.with_metrics_file(path.clone());
    }

    info!(job_id = %job_id, "Coordinator starting");

    let exit = if args.resume {
        coordinator.resume(shutdown_signal()).await?
    } else {
        let items = match &args.input_file {
            Some(path) => read_items(path)?,
            None => anyhow::bail!("--input-file is required unless --resume is given"),
        };
        info!(items = items.len(), path = ?args.input_file, "Loaded work items");
        coordinator.run(&items, shutdown_signal()).await?
    };

    match exit {
        MonitorExit::Completed(snapshot) => {
            info!(
                job_id = %job_id,
                completed_batches = snapshot.counters.completed,
                failed_items = snapshot.metrics.failed_items,
                "Job finished"
            );
        }
        MonitorExit::Interrupted => {
            info!(job_id = %job_id, "Coordinator interrupted; rerun with --resume to continue");
        }
    }
    Ok(())
}

/// JSON document printed by `status`.
#[derive(Debug, Serialize)]
struct StatusReport {
    job_id: String,
    config: Option<JobConfig>,
    progress: Option<ProgressSnapshot>,
}

async fn run_status_command(config: CoordinatorConfig, args: JobArgs) -> anyhow::Result<()> {
    let store = connect(&config).await?;
    let keys = JobKeys::new(&config.key_prefix, &args.job_id);

    let job_config = match store.get(&keys.config).await? {
        Some(raw) => Some(JobConfig::from_json(&args.job_id, &raw)?),
        None => None,
    };
    let monitor = ProgressMonitor::new(store, keys, MonitorSettings::from(&config));
    let progress = monitor.snapshot().await?;

    let report = StatusReport {
        job_id: args.job_id,
        config: job_config,
        progress,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_recover_command(config: CoordinatorConfig, args: RecoverArgs) -> anyhow::Result<()> {
    let threshold = args
        .stall_threshold
        .map(Duration::from_secs)
        .unwrap_or(config.stall_threshold);
    let store = connect(&config).await?;
    let engine = RecoveryEngine::new(store, JobKeys::new(&config.key_prefix, &args.job_id));

    let failed = engine.recover_failed_tasks().await?;
    let stalled = engine.recover_stalled_tasks(threshold).await?;

    println!(
        "{}",
        serde_json::json!({
            "job_id": args.job_id,
            "recovered_failed": failed,
            "recovered_stalled": stalled,
        })
    );
    Ok(())
}

async fn run_reconcile_command(config: CoordinatorConfig, args: JobArgs) -> anyhow::Result<()> {
    let store = connect(&config).await?;
    let engine = RecoveryEngine::new(store, JobKeys::new(&config.key_prefix, &args.job_id));

    let reconciliation = engine.reconcile_counters().await?;
    println!("{}", serde_json::to_string_pretty(&reconciliation)?);
    Ok(())
}
