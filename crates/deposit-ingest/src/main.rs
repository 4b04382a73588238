//! Deposit Ingest - deposit ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deposit_common::logging::{init_logging, LogConfig, LogLevel};
use deposit_common::{DepositId, ObjectId};
use deposit_ingest::config::{IngestConfig, MODEL_FILE_NAME};
use deposit_ingest::model::{DepositGraph, DepositModelStore, ResourceType};
use deposit_ingest::orchestrator::{DepositOrchestrator, DepositServices};
use deposit_ingest::repository::InMemoryRepository;
use deposit_ingest::services::memory::{
    DigestReportExtractor, InMemoryStatusStore, MemoryProvenanceLog, StaticAuthorization,
    ThroughputCounter,
};
use deposit_ingest::services::DepositStatus;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "deposit-ingest")]
#[command(author, version, about = "Deposit ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a staged deposit model and print its work sizing
    Validate {
        /// Path to the model.json of a deposit
        model: PathBuf,
    },

    /// Run a deposit end to end against in-memory collaborators
    Rehearse {
        /// Deposit directory holding model.json and the staged files
        #[arg(short, long)]
        deposit_dir: PathBuf,

        /// Number of concurrent extraction workers
        #[arg(short, long)]
        workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("deposit-ingest")
        .build()
        .merge_env()?;

    init_logging(&log_config)?;

    match cli.command {
        Command::Validate { model } => validate(&model),
        Command::Rehearse {
            deposit_dir,
            workers,
        } => rehearse(&deposit_dir, workers).await,
    }
}

fn validate(path: &Path) -> Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let graph = DepositGraph::from_json(&json)
        .with_context(|| format!("Invalid deposit model {}", path.display()))?;

    let ids = graph.pre_order_ids();
    let count = |kind: ResourceType| {
        ids.iter()
            .filter_map(|id| graph.get(id))
            .filter(|r| r.resource_type == kind)
            .count()
    };

    println!("Deposit model {} is valid", path.display());
    println!("  root:        {}", graph.root_id());
    println!("  folders:     {}", count(ResourceType::Folder));
    println!("  works:       {}", count(ResourceType::Work));
    println!("  files:       {}", count(ResourceType::File));
    println!("  total units: {}", ids.len());
    Ok(())
}

async fn rehearse(deposit_dir: &Path, workers: Option<usize>) -> Result<()> {
    let deposit_dir = deposit_dir
        .canonicalize()
        .with_context(|| format!("Deposit directory {} not found", deposit_dir.display()))?;
    let deposit_id: DepositId = deposit_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .context("Deposit directory has no name")?
        .parse()?;
    let deposits_dir = deposit_dir
        .parent()
        .context("Deposit directory has no parent")?
        .to_path_buf();

    let mut config = IngestConfig::from_env()?.with_deposits_dir(&deposits_dir);
    if let Some(workers) = workers {
        config.concurrency.worker_count = workers;
        config.concurrency.max_queued_jobs = config.concurrency.max_queued_jobs.max(workers * 2);
    }
    config.validate()?;

    let models = Arc::new(DepositModelStore::persistent(&deposits_dir));
    let graph = models
        .read(&deposit_id)
        .with_context(|| format!("Failed to load {} from {}", MODEL_FILE_NAME, deposit_dir.display()))?;

    let destination: ObjectId = "rehearsal-destination".parse()?;
    let repository = Arc::new(InMemoryRepository::new());
    repository.seed_folder(&destination);

    let mut deposit = DepositStatus::new(deposit_id.clone(), destination)
        .with_groups(["rehearsal"])
        .with_depositor("rehearsal")
        .with_method("cli rehearsal");
    if let Some(label) = graph.root().label() {
        deposit = deposit.with_label(label);
    }
    let status = Arc::new(InMemoryStatusStore::new());
    status.register_deposit(deposit);

    let metrics = Arc::new(ThroughputCounter::new());
    let services = DepositServices {
        status,
        models,
        repository: repository.clone(),
        authorization: Arc::new(StaticAuthorization::allow_all()),
        metrics: metrics.clone(),
        provenance: Arc::new(MemoryProvenanceLog::new()),
        extractor: Arc::new(DigestReportExtractor),
    };

    info!(deposit_id = %deposit_id, dir = %deposit_dir.display(), "Rehearsing deposit");
    let orchestrator = DepositOrchestrator::new(services, config);
    let runs = orchestrator.run_deposit(&deposit_id).await?;

    println!("Deposit {} rehearsed", deposit_id);
    for run in &runs {
        println!("  {:<16} {}", run.name, run.job_id);
    }
    println!("  objects created:   {}", repository.total_creations());
    println!("  bytes transferred: {}", metrics.bytes_for(&deposit_id));
    Ok(())
}
