//! Deposit record materialization
//!
//! Every deposit gets one record object, keyed by the deposit id, that
//! describes the submission itself. Content objects point back at it through
//! their `original_deposit` property. Re-running the job overwrites the
//! record's properties and manifests instead of creating a second one.

use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::JobError;
use crate::job::{DepositJob, JobContext};
use crate::model::{Manifest, ModelTransaction};
use crate::repository::{
    finish_transaction, ObjectDescription, RepositoryBackend, MANIFEST_PREFIX,
};
use crate::services::{DepositStatus, EventType, ProvenanceEvent, ProvenanceLog};
use crate::staging::{resolve_staging_location, staged_file_name};

struct StagedManifest {
    name: String,
    path: PathBuf,
    mimetype: Option<String>,
}

/// Creates or refreshes the record object describing a deposit
pub struct DepositRecordJob {
    ctx: JobContext,
    repository: Arc<dyn RepositoryBackend>,
    provenance: Arc<dyn ProvenanceLog>,
}

impl DepositRecordJob {
    pub fn new(
        ctx: JobContext,
        repository: Arc<dyn RepositoryBackend>,
        provenance: Arc<dyn ProvenanceLog>,
    ) -> Self {
        Self {
            ctx,
            repository,
            provenance,
        }
    }

    fn describe(&self, deposit: &DepositStatus, fallback_title: Option<&str>) -> ObjectDescription {
        let mut description = ObjectDescription::titled(deposit.label.as_deref().or(fallback_title))
            .with_original_deposit(&self.ctx.deposit_id)
            .with_property("submitted_at", deposit.submitted_at.to_rfc3339());
        if let Some(depositor) = &deposit.depositor_name {
            description = description.with_property("depositor", depositor);
        }
        if let Some(method) = &deposit.deposit_method {
            description = description.with_property("deposit_method", method);
        }
        if let Some(profile) = &deposit.packaging_profile {
            description = description.with_property("packaging_profile", profile);
        }
        description
    }

    /// Resolve every declared manifest, failing on the first missing one
    fn stage_manifests(&self, manifests: &[Manifest]) -> Result<Vec<StagedManifest>, JobError> {
        let deposit_dir = self.ctx.deposit_dir();
        manifests
            .iter()
            .enumerate()
            .map(|(index, manifest)| {
                let path = resolve_staging_location(&deposit_dir, &manifest.location);
                if !path.is_file() {
                    return Err(self.ctx.fail_job(
                        format!("Manifest {} is missing", manifest.location),
                        format!(
                            "Deposit {} declares manifest {} but {} does not exist",
                            self.ctx.deposit_id,
                            manifest.location,
                            path.display()
                        ),
                    ));
                }
                Ok(StagedManifest {
                    name: staged_file_name(&manifest.location)
                        .unwrap_or_else(|| format!("manifest-{}", index)),
                    path,
                    mimetype: manifest.mimetype.clone(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl DepositJob for DepositRecordJob {
    fn name(&self) -> &str {
        "deposit_record"
    }

    fn context(&self) -> &JobContext {
        &self.ctx
    }

    async fn run_job(&self, model: &mut ModelTransaction<'_>) -> Result<(), JobError> {
        let ctx = &self.ctx;
        let deposit = ctx
            .status
            .get_deposit(&ctx.deposit_id)
            .await
            .context("Failed to load deposit status")?;
        ctx.status
            .set_total_units(&ctx.job_id, 1)
            .await
            .context("Failed to set total units")?;

        let root = model.graph().root();
        let record_id = ctx.deposit_id.record_id();
        let description = self.describe(&deposit, root.label());
        let manifests = self.stage_manifests(&root.properties.manifests)?;
        let existing = self.repository.exists(&record_id).await?;

        let mut tx = self.repository.begin().await?;
        let outcome: Result<(), JobError> = async {
            if existing {
                tx.update_properties(&record_id, description).await?;
            } else {
                tx.create_deposit_record(&record_id, description).await?;
            }
            for manifest in &manifests {
                let content = tokio::fs::File::open(&manifest.path).await?;
                tx.add_binary(
                    &record_id,
                    &format!("{}{}", MANIFEST_PREFIX, manifest.name),
                    manifest.mimetype.as_deref(),
                    Box::new(content),
                )
                .await?;
                debug!(record = %record_id, manifest = %manifest.name, "Attached manifest");
            }
            Ok(())
        }
        .await;
        finish_transaction(tx, outcome).await?;

        if !existing {
            let mut details = vec![format!("Deposit record created for deposit {}", ctx.deposit_id)];
            if let Some(method) = &deposit.deposit_method {
                details.push(format!("Submitted via {}", method));
            }
            if let Some(depositor) = &deposit.depositor_name {
                details.push(format!("Deposited by {}", depositor));
            }
            self.provenance
                .append_event(&record_id, ProvenanceEvent::new(EventType::Ingestion, details))
                .await
                .context("Failed to record deposit record provenance")?;
        }

        ctx.status
            .increment_completed(&ctx.job_id, 1)
            .await
            .context("Failed to update completed units")?;

        info!(
            job_id = %ctx.job_id,
            deposit_id = %ctx.deposit_id,
            record = %record_id,
            manifests = manifests.len(),
            updated = existing,
            "Deposit record materialized"
        );
        Ok(())
    }
}
