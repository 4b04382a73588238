//! Test helpers for deposit ingestion integration tests
//!
//! This module provides:
//! - A per-test deposit environment in a temporary directory
//! - In-memory collaborators wired the way the orchestrator wires them
//! - Staged file and technical metadata fixtures
//! - Graph builders (see [`fixtures`])

#![allow(dead_code)]

pub mod fixtures;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use deposit_common::{DepositId, JobId, ObjectId};
use deposit_ingest::config::{ConcurrencyConfig, IngestConfig};
use deposit_ingest::job::JobContext;
use deposit_ingest::jobs::techmd::report_path;
use deposit_ingest::jobs::{DepositRecordJob, ExtractTechnicalMetadataJob, IngestContentObjectsJob};
use deposit_ingest::model::{DepositGraph, DepositModelStore};
use deposit_ingest::orchestrator::DepositServices;
use deposit_ingest::repository::InMemoryRepository;
use deposit_ingest::services::memory::{
    DigestReportExtractor, InMemoryStatusStore, MemoryProvenanceLog, StaticAuthorization,
    ThroughputCounter,
};
use deposit_ingest::services::{
    AuthorizationService, DepositState, DepositStatus, JobProgress, TechnicalMetadataExtractor,
};

pub use fixtures::*;

/// Destination folder every test deposit targets
pub const DESTINATION: &str = "destination";

/// Install a test subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deposit_ingest=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Concurrency settings small enough for tests to finish quickly
pub fn fast_concurrency() -> ConcurrencyConfig {
    ConcurrencyConfig {
        worker_count: 2,
        max_queued_jobs: 4,
        flush_interval: Duration::from_millis(10),
        registrar_shutdown_timeout: Duration::from_secs(5),
        capacity_poll_interval: Duration::from_millis(2),
    }
}

/// One deposit with its collaborators and a temporary deposits directory
pub struct TestDeposit {
    pub dir: TempDir,
    pub deposit_id: DepositId,
    pub destination: ObjectId,
    pub config: Arc<IngestConfig>,
    pub status: Arc<InMemoryStatusStore>,
    pub models: Arc<DepositModelStore>,
    pub repository: Arc<InMemoryRepository>,
    pub metrics: Arc<ThroughputCounter>,
    pub provenance: Arc<MemoryProvenanceLog>,
    pub authorization: Arc<dyn AuthorizationService>,
    pub extractor: Arc<dyn TechnicalMetadataExtractor>,
}

impl TestDeposit {
    /// Running deposit of `graph` targeting an empty destination folder
    pub fn new(graph: DepositGraph) -> Self {
        init_tracing();

        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let deposit_id: DepositId = DEPOSIT.parse().expect("valid deposit id");
        let destination = id(DESTINATION);

        let config = IngestConfig::default()
            .with_deposits_dir(dir.path())
            .with_concurrency(fast_concurrency());
        std::fs::create_dir_all(config.deposit_dir(&deposit_id)).unwrap();

        let models = Arc::new(DepositModelStore::in_memory());
        models.insert(&deposit_id, graph).expect("valid graph");

        let repository = Arc::new(InMemoryRepository::new());
        repository.seed_folder(&destination);

        let status = Arc::new(InMemoryStatusStore::new());
        let mut deposit = DepositStatus::new(deposit_id.clone(), destination.clone())
            .with_groups(["depositors"])
            .with_label("Test deposit")
            .with_depositor("jdoe")
            .with_method("sword")
            .with_packaging_profile("simple");
        deposit.state = DepositState::Running;
        status.register_deposit(deposit);

        Self {
            dir,
            deposit_id,
            destination,
            config: Arc::new(config),
            status,
            models,
            repository,
            metrics: Arc::new(ThroughputCounter::new()),
            provenance: Arc::new(MemoryProvenanceLog::new()),
            authorization: Arc::new(StaticAuthorization::new(["depositors"])),
            extractor: Arc::new(DigestReportExtractor),
        }
    }

    pub fn deposit_dir(&self) -> PathBuf {
        self.config.deposit_dir(&self.deposit_id)
    }

    /// Write a staged file relative to the deposit directory
    pub fn stage_file(&self, location: &str, contents: &[u8]) -> PathBuf {
        let path = self.deposit_dir().join(location);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Write the technical metadata report of a file
    pub fn write_techmd(&self, file_id: &str) -> PathBuf {
        let techmd_dir = self.config.techmd_dir(&self.deposit_id);
        std::fs::create_dir_all(&techmd_dir).unwrap();
        let path = report_path(&techmd_dir, &id(file_id));
        std::fs::write(&path, format!("<techmd><id>{}</id></techmd>", file_id)).unwrap();
        path
    }

    /// Stage both files of [`scenario_graph`] with their reports
    pub fn stage_scenario_files(&self) {
        self.stage_file("data/f1.bin", b"first file");
        self.stage_file("data/f2.txt", b"second");
        self.write_techmd("f1");
        self.write_techmd("f2");
    }

    pub fn set_state(&self, state: DepositState) {
        let mut deposit = self.status.deposit(&self.deposit_id).unwrap();
        deposit.state = state;
        self.status.register_deposit(deposit);
    }

    pub fn set_destination(&mut self, destination: ObjectId) {
        let mut deposit = self.status.deposit(&self.deposit_id).unwrap();
        deposit.destination = destination.clone();
        self.status.register_deposit(deposit);
        self.destination = destination;
    }

    pub fn mark_resumed(&self) {
        self.status.set_resumed(&self.deposit_id, true);
    }

    pub fn context(&self) -> JobContext {
        JobContext::new(
            JobId::new(),
            self.deposit_id.clone(),
            self.status.clone(),
            self.models.clone(),
            self.config.clone(),
        )
    }

    pub fn ingest_job(&self) -> IngestContentObjectsJob {
        IngestContentObjectsJob::new(
            self.context(),
            self.repository.clone(),
            self.authorization.clone(),
            self.metrics.clone(),
        )
    }

    pub fn record_job(&self) -> DepositRecordJob {
        DepositRecordJob::new(
            self.context(),
            self.repository.clone(),
            self.provenance.clone(),
        )
    }

    pub fn techmd_job(&self) -> ExtractTechnicalMetadataJob {
        ExtractTechnicalMetadataJob::new(self.context(), self.extractor.clone())
    }

    pub fn services(&self) -> DepositServices {
        DepositServices {
            status: self.status.clone(),
            models: self.models.clone(),
            repository: self.repository.clone(),
            authorization: self.authorization.clone(),
            metrics: self.metrics.clone(),
            provenance: self.provenance.clone(),
            extractor: self.extractor.clone(),
        }
    }

    pub fn progress(&self, job_id: &JobId) -> JobProgress {
        self.status.job(job_id).expect("job progress recorded")
    }

    pub fn members(&self, container: &str) -> Vec<String> {
        self.repository
            .object(&id(container))
            .map(|o| o.members.into_iter().map(String::from).collect())
            .unwrap_or_default()
    }
}
