//! Technical metadata extraction
//!
//! Runs the extractor over every staged file of a deposit on the concurrent
//! worker pool and writes one report per file into the deposit's technical
//! metadata directory, where content ingestion picks them up. Files that
//! already have a report are skipped, so a resumed run only extracts what is
//! missing.

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use deposit_common::{JobId, ObjectId};

use crate::error::JobError;
use crate::job::{ConcurrentDepositJob, DepositJob, JobContext, ResultRegistrar};
use crate::model::ModelTransaction;
use crate::services::{StatusStore, TechnicalMetadataExtractor};
use crate::staging::resolve_staging_location;

/// Report produced for one staged file
pub struct ExtractedReport {
    pub file_id: ObjectId,
    pub report: Vec<u8>,
}

/// Path of the report of `file_id` inside `techmd_dir`
///
/// Reports are named by the SHA-256 of the id, so every id maps to its own
/// file whatever characters it contains.
pub fn report_path(techmd_dir: &Path, file_id: &ObjectId) -> PathBuf {
    let digest = Sha256::digest(file_id.as_str().as_bytes());
    techmd_dir.join(format!("{}.xml", hex::encode(digest)))
}

/// Writes report batches to disk and advances job progress
struct ReportWriter {
    job_id: JobId,
    techmd_dir: PathBuf,
    status: Arc<dyn StatusStore>,
}

#[async_trait]
impl ResultRegistrar<ExtractedReport> for ReportWriter {
    async fn register_results(&self, results: Vec<ExtractedReport>) -> Result<(), JobError> {
        tokio::fs::create_dir_all(&self.techmd_dir).await?;
        for result in &results {
            let path = report_path(&self.techmd_dir, &result.file_id);
            let tmp = path.with_extension("xml.tmp");
            tokio::fs::write(&tmp, &result.report).await?;
            tokio::fs::rename(&tmp, &path).await?;
        }

        self.status
            .increment_completed(&self.job_id, results.len() as u64)
            .await
            .context("Failed to update completed units")?;
        debug!(job_id = %self.job_id, count = results.len(), "Wrote technical metadata reports");
        Ok(())
    }
}

/// Extracts technical metadata for every staged file of a deposit
pub struct ExtractTechnicalMetadataJob {
    ctx: JobContext,
    extractor: Arc<dyn TechnicalMetadataExtractor>,
}

impl ExtractTechnicalMetadataJob {
    pub fn new(ctx: JobContext, extractor: Arc<dyn TechnicalMetadataExtractor>) -> Self {
        Self { ctx, extractor }
    }

    async fn submit_all(
        &self,
        pool: &ConcurrentDepositJob<ExtractedReport>,
        files: Vec<(ObjectId, Option<String>)>,
    ) -> Result<(), JobError> {
        let deposit_dir = self.ctx.deposit_dir();
        for (file_id, location) in files {
            self.ctx.verify_running().await?;
            pool.wait_for_queue_capacity().await?;

            let Some(location) = location else {
                return Err(self.ctx.fail_job(
                    format!("No staging location provided for file {}", file_id),
                    format!(
                        "File {} of deposit {} has no staging location to extract from",
                        file_id, self.ctx.deposit_id
                    ),
                ));
            };
            let path = resolve_staging_location(&deposit_dir, &location);
            let extractor = self.extractor.clone();
            let sink = pool.result_sink();

            pool.submit_task(async move {
                let report = extractor.extract(&path).await.map_err(|e| {
                    JobError::failed(
                        format!("Technical metadata extraction failed for file {}", file_id),
                        format!("{}: {:#}", path.display(), e),
                    )
                })?;
                sink.receive_result(ExtractedReport { file_id, report });
                Ok(())
            });
        }

        pool.wait_for_completion().await
    }
}

#[async_trait]
impl DepositJob for ExtractTechnicalMetadataJob {
    fn name(&self) -> &str {
        "extract_techmd"
    }

    fn context(&self) -> &JobContext {
        &self.ctx
    }

    async fn run_job(&self, model: &mut ModelTransaction<'_>) -> Result<(), JobError> {
        let ctx = &self.ctx;
        let techmd_dir = ctx.techmd_dir();
        let files = model.graph().file_resources();
        let total = files.len();

        let mut pending = Vec::new();
        for file in files {
            if !tokio::fs::try_exists(report_path(&techmd_dir, &file.id)).await? {
                pending.push((file.id.clone(), file.properties.staging_location.clone()));
            }
        }

        ctx.status
            .set_total_units(&ctx.job_id, total as u64)
            .await
            .context("Failed to set total units")?;
        ctx.status
            .set_completed_units(&ctx.job_id, (total - pending.len()) as u64)
            .await
            .context("Failed to set completed units")?;

        info!(
            job_id = %ctx.job_id,
            deposit_id = %ctx.deposit_id,
            files = total,
            pending = pending.len(),
            "Extracting technical metadata"
        );
        if pending.is_empty() {
            return Ok(());
        }

        let pool = ConcurrentDepositJob::new(ctx.job_id, ctx.config.concurrency.clone());
        pool.start_result_registrar(Arc::new(ReportWriter {
            job_id: ctx.job_id,
            techmd_dir: techmd_dir.clone(),
            status: ctx.status.clone(),
        }));

        let extracted = pending.len();
        match self.submit_all(&pool, pending).await {
            Ok(()) => pool.await_registrar_shutdown().await?,
            Err(e) => {
                pool.cancel_pending();
                if let Err(shutdown) = pool.await_registrar_shutdown().await {
                    warn!(job_id = %ctx.job_id, error = %shutdown, "Result registrar did not stop cleanly");
                }
                return Err(e);
            }
        }

        info!(
            job_id = %ctx.job_id,
            deposit_id = %ctx.deposit_id,
            extracted,
            dir = %techmd_dir.display(),
            "Technical metadata extracted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> ObjectId {
        value.parse().unwrap()
    }

    #[test]
    fn test_report_paths_are_distinct_per_id() {
        let dir = Path::new("/deposits/d1/techmd");
        let colon = report_path(dir, &id("f:1"));
        let semicolon = report_path(dir, &id("f;1"));
        let slashed = report_path(dir, &id("info:fedora/f_1"));

        assert_ne!(colon, semicolon);
        assert_ne!(colon, slashed);
        assert_eq!(colon.parent(), Some(dir));
        assert_eq!(colon, report_path(dir, &id("f:1")));
    }

    #[test]
    fn test_report_path_stays_inside_dir() {
        let dir = Path::new("/deposits/d1/techmd");
        let path = report_path(dir, &id("../../etc/passwd"));
        assert_eq!(path.parent(), Some(dir));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("xml"));
    }
}
