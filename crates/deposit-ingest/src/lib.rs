//! Deposit Ingest Library
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//!
//! Materializes staged deposits as object hierarchies in a repository.
//!
//! # Overview
//!
//! - **Model**: the staged content graph of a deposit and its transactional store
//! - **Job framework**: the job lifecycle and the bounded concurrent worker pool
//! - **Jobs**: deposit record, technical metadata extraction, content ingestion
//! - **Collaborators**: repository backend, status store, authorization,
//!   throughput metrics, provenance log and metadata extraction, with
//!   in-memory implementations
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use deposit_ingest::config::IngestConfig;
//! use deposit_ingest::model::DepositModelStore;
//! use deposit_ingest::orchestrator::{DepositOrchestrator, DepositServices};
//! use deposit_ingest::repository::InMemoryRepository;
//! use deposit_ingest::services::memory::{
//!     DigestReportExtractor, InMemoryStatusStore, MemoryProvenanceLog, StaticAuthorization,
//!     ThroughputCounter,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let services = DepositServices {
//!         status: Arc::new(InMemoryStatusStore::new()),
//!         models: Arc::new(DepositModelStore::persistent(&config.deposits_dir)),
//!         repository: Arc::new(InMemoryRepository::new()),
//!         authorization: Arc::new(StaticAuthorization::allow_all()),
//!         metrics: Arc::new(ThroughputCounter::new()),
//!         provenance: Arc::new(MemoryProvenanceLog::new()),
//!         extractor: Arc::new(DigestReportExtractor),
//!     };
//!     let orchestrator = DepositOrchestrator::new(services, config);
//!     orchestrator.run_deposit(&"deposit-1".parse()?).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod jobs;
pub mod model;
pub mod orchestrator;
pub mod repository;
pub mod services;
pub mod staging;

pub use config::{ConcurrencyConfig, IngestConfig};
pub use error::{JobError, ModelError, RepositoryError};
pub use job::{ConcurrentDepositJob, DepositJob, JobContext};
pub use model::{DepositGraph, DepositModelStore, StagedResource};
pub use orchestrator::{DepositOrchestrator, DepositServices};
