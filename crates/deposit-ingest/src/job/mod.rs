//! Deposit job execution framework
//!
//! A job is built from a [`JobContext`] naming the job and its deposit. The
//! scheduler only ever calls [`DepositJob::run`], which opens a write
//! transaction on the deposit model, hands it to [`DepositJob::run_job`],
//! commits on success and aborts on any error.
//!
//! `run` surfaces exactly two error kinds: [`JobError::Failed`] for fatal,
//! non-retriable problems (raised through [`JobContext::fail_job`]) and
//! [`JobError::Interrupted`] when cooperative cancellation was observed.

pub mod concurrent;

use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use deposit_common::{DepositId, JobId};

use crate::config::IngestConfig;
use crate::error::{error_chain, JobError, ModelError};
use crate::model::{DepositModelStore, ModelTransaction};
use crate::services::{DepositState, JobState, StatusStore};

pub use concurrent::{ConcurrentDepositJob, ResultRegistrar, ResultSink};

/// Identity and shared collaborators of one job execution
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub deposit_id: DepositId,
    pub status: Arc<dyn StatusStore>,
    pub models: Arc<DepositModelStore>,
    pub config: Arc<IngestConfig>,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        deposit_id: DepositId,
        status: Arc<dyn StatusStore>,
        models: Arc<DepositModelStore>,
        config: Arc<IngestConfig>,
    ) -> Self {
        Self {
            job_id,
            deposit_id,
            status,
            models,
            config,
        }
    }

    /// Raise [`JobError::Interrupted`] unless the deposit is still running
    ///
    /// Long loops call this between units of work; nothing else stops a job.
    pub async fn verify_running(&self) -> Result<(), JobError> {
        let state = self
            .status
            .get_deposit_state(&self.deposit_id)
            .await
            .context("Failed to read deposit state")?;

        if state != DepositState::Running {
            return Err(JobError::Interrupted(format!(
                "Deposit {} is {}, no longer running",
                self.deposit_id, state
            )));
        }
        Ok(())
    }

    /// Fatal, non-retriable failure
    pub fn fail_job(&self, message: impl Into<String>, details: impl Into<String>) -> JobError {
        JobError::failed(message, details)
    }

    /// Fatal failure caused by another error; the cause becomes the details
    pub fn fail_job_with(
        &self,
        cause: &(dyn std::error::Error + 'static),
        message: impl Into<String>,
    ) -> JobError {
        JobError::failed(message, error_chain(cause))
    }

    /// Directory holding the deposit's staged files
    pub fn deposit_dir(&self) -> PathBuf {
        self.config.deposit_dir(&self.deposit_id)
    }

    /// Side directory holding technical metadata reports
    pub fn techmd_dir(&self) -> PathBuf {
        self.config.techmd_dir(&self.deposit_id)
    }

    /// Log and record a job error, returning it in reportable form
    async fn report(&self, job_name: &str, err: JobError) -> JobError {
        let err = err.into_reportable();
        match &err {
            JobError::Failed { message, details } => {
                error!(
                    job = job_name,
                    job_id = %self.job_id,
                    deposit_id = %self.deposit_id,
                    error = %message,
                    details = details.as_deref().unwrap_or(""),
                    "Job failed"
                );
                if let Err(e) = self
                    .status
                    .record_job_failure(&self.job_id, message, details.as_deref())
                    .await
                {
                    warn!(job_id = %self.job_id, error = %e, "Failed to record job failure");
                }
            }
            JobError::Interrupted(reason) => {
                warn!(
                    job = job_name,
                    job_id = %self.job_id,
                    deposit_id = %self.deposit_id,
                    reason = %reason,
                    "Job interrupted"
                );
                if let Err(e) = self
                    .status
                    .set_job_state(&self.job_id, JobState::Interrupted)
                    .await
                {
                    warn!(job_id = %self.job_id, error = %e, "Failed to record job interruption");
                }
            }
            _ => {}
        }
        err
    }
}

/// A unit of ingestion work over one deposit
#[async_trait]
pub trait DepositJob: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    fn context(&self) -> &JobContext;

    /// Job body, run inside a write transaction on the deposit model
    async fn run_job(&self, model: &mut ModelTransaction<'_>) -> Result<(), JobError>;

    /// Execute the job
    ///
    /// The model transaction is committed when `run_job` returns normally and
    /// aborted otherwise, leaving the deposit model unchanged for this attempt.
    async fn run(&self) -> Result<(), JobError> {
        let ctx = self.context();
        let started = Instant::now();
        info!(
            job = self.name(),
            job_id = %ctx.job_id,
            deposit_id = %ctx.deposit_id,
            "Starting job"
        );

        let outcome = async {
            ctx.status
                .set_job_state(&ctx.job_id, JobState::Running)
                .await
                .context("Failed to mark job as running")?;

            let mut model = ctx.models.begin_write(&ctx.deposit_id).map_err(|e| match e {
                ModelError::Invalid(_) | ModelError::Serialization(_) => ctx.fail_job_with(
                    &e,
                    format!("Invalid deposit model for {}", ctx.deposit_id),
                ),
                other => other.into(),
            })?;
            match self.run_job(&mut model).await {
                Ok(()) => model.commit()?,
                Err(e) => {
                    model.abort();
                    return Err(e);
                }
            }

            ctx.status
                .set_job_state(&ctx.job_id, JobState::Completed)
                .await
                .context("Failed to mark job as completed")?;
            Ok::<(), JobError>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(
                    job = self.name(),
                    job_id = %ctx.job_id,
                    deposit_id = %ctx.deposit_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
                Ok(())
            }
            Err(e) => Err(ctx.report(self.name(), e).await),
        }
    }
}
