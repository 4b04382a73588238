//! Deposit orchestrator
//!
//! Runs the job sequence of one deposit: deposit record, technical metadata
//! extraction, then content ingestion. Each job gets its own job id. A job
//! failure marks the deposit failed; an interruption leaves its state alone
//! so the deposit can be resumed.

use anyhow::Context;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use deposit_common::{DepositId, JobId};

use crate::config::IngestConfig;
use crate::error::JobError;
use crate::job::{DepositJob, JobContext};
use crate::jobs::{DepositRecordJob, ExtractTechnicalMetadataJob, IngestContentObjectsJob};
use crate::model::DepositModelStore;
use crate::repository::RepositoryBackend;
use crate::services::{
    AuthorizationService, DepositState, ProvenanceLog, StatusStore, TechnicalMetadataExtractor,
    ThroughputMetrics,
};

/// Collaborators shared by every job of a deposit
#[derive(Clone)]
pub struct DepositServices {
    pub status: Arc<dyn StatusStore>,
    pub models: Arc<DepositModelStore>,
    pub repository: Arc<dyn RepositoryBackend>,
    pub authorization: Arc<dyn AuthorizationService>,
    pub metrics: Arc<dyn ThroughputMetrics>,
    pub provenance: Arc<dyn ProvenanceLog>,
    pub extractor: Arc<dyn TechnicalMetadataExtractor>,
}

/// A job executed for a deposit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub name: String,
    pub job_id: JobId,
}

/// Runs deposits end to end
pub struct DepositOrchestrator {
    services: DepositServices,
    config: Arc<IngestConfig>,
}

impl DepositOrchestrator {
    pub fn new(services: DepositServices, config: IngestConfig) -> Self {
        Self {
            services,
            config: Arc::new(config),
        }
    }

    fn context(&self, deposit_id: &DepositId) -> JobContext {
        JobContext::new(
            JobId::new(),
            deposit_id.clone(),
            self.services.status.clone(),
            self.services.models.clone(),
            self.config.clone(),
        )
    }

    /// Jobs of a deposit in execution order
    pub fn jobs(&self, deposit_id: &DepositId) -> Vec<Box<dyn DepositJob>> {
        let services = &self.services;
        vec![
            Box::new(DepositRecordJob::new(
                self.context(deposit_id),
                services.repository.clone(),
                services.provenance.clone(),
            )),
            Box::new(ExtractTechnicalMetadataJob::new(
                self.context(deposit_id),
                services.extractor.clone(),
            )),
            Box::new(IngestContentObjectsJob::new(
                self.context(deposit_id),
                services.repository.clone(),
                services.authorization.clone(),
                services.metrics.clone(),
            )),
        ]
    }

    /// Run every job of a deposit
    ///
    /// Failed and completed deposits are refused. To resume an interrupted or
    /// failed deposit an operator flags it resumed and registers it again.
    pub async fn run_deposit(&self, deposit_id: &DepositId) -> Result<Vec<JobRun>, JobError> {
        let status = &self.services.status;
        let state = status
            .get_deposit_state(deposit_id)
            .await
            .context("Failed to read deposit state")?;
        if state.is_terminal() {
            return Err(JobError::failed(
                format!("Deposit {} is already {}", deposit_id, state),
                format!(
                    "Deposit {} reached the terminal state {} and cannot be run again",
                    deposit_id, state
                ),
            ));
        }

        status
            .set_deposit_state(deposit_id, DepositState::Running)
            .await
            .context("Failed to mark deposit as running")?;

        let started = Instant::now();
        info!(deposit_id = %deposit_id, previous_state = %state, "Starting deposit");

        let mut runs = Vec::new();
        for job in self.jobs(deposit_id) {
            let run = JobRun {
                name: job.name().to_string(),
                job_id: job.context().job_id,
            };

            match job.run().await {
                Ok(()) => runs.push(run),
                Err(e) if e.is_interrupted() => {
                    warn!(
                        deposit_id = %deposit_id,
                        job = %run.name,
                        job_id = %run.job_id,
                        reason = %e,
                        "Deposit interrupted"
                    );
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        deposit_id = %deposit_id,
                        job = %run.name,
                        job_id = %run.job_id,
                        error = %e,
                        "Deposit failed"
                    );
                    if let Err(state_err) =
                        status.set_deposit_state(deposit_id, DepositState::Failed).await
                    {
                        warn!(
                            deposit_id = %deposit_id,
                            error = %state_err,
                            "Failed to mark deposit as failed"
                        );
                    }
                    return Err(e);
                }
            }
        }

        status
            .set_deposit_state(deposit_id, DepositState::Completed)
            .await
            .context("Failed to mark deposit as completed")?;

        info!(
            deposit_id = %deposit_id,
            jobs = runs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Deposit completed"
        );
        Ok(runs)
    }
}
