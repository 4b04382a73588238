//! Content ingestion walk
//!
//! Materializes a deposit's staged graph below its destination container.
//! The walk is depth-first in document order. Each folder or work is created
//! in its own repository transaction and linked to its parent in that same
//! transaction; a file is created together with its technical metadata
//! report. A failing node cancels only its own transaction and ends the job,
//! so everything committed before it survives for the next, resumed run.
//!
//! | staged type | destination | action |
//! |---|---|---|
//! | folder | any | create or reuse a folder, recurse |
//! | work | any | create or reuse a work, recurse, then link its primary object |
//! | file | work | create the file as a member of the work |
//! | file | folder | create a work around the file, the file is its primary object |

use anyhow::Context;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use deposit_common::ObjectId;

use crate::error::{JobError, RepositoryError};
use crate::job::{DepositJob, JobContext};
use crate::jobs::techmd::report_path;
use crate::model::{DepositGraph, ModelTransaction, ResourceType, StagedResource};
use crate::repository::{
    finish_transaction, FileDescription, ObjectDescription, ObjectType, RepositoryBackend,
    RepositoryObject, RepositoryTransaction, TECHNICAL_METADATA,
};
use crate::services::{AuthorizationService, Permission, ThroughputMetrics};
use crate::staging::{resolve_staging_location, staged_file_name};

/// Mimetype of technical metadata reports
const TECHMD_MIMETYPE: &str = "text/xml";

/// Repository container new objects are linked into
#[derive(Debug, Clone)]
struct Container {
    id: ObjectId,
    object_type: ObjectType,
}

impl From<&RepositoryObject> for Container {
    fn from(object: &RepositoryObject) -> Self {
        Self {
            id: object.id.clone(),
            object_type: object.object_type,
        }
    }
}

/// State shared by one walk over a deposit graph
struct Walk<'g> {
    graph: &'g DepositGraph,
    resumed: bool,
    previously_ingested: HashSet<ObjectId>,
    created: AtomicU64,
}

impl Walk<'_> {
    fn was_ingested(&self, id: &ObjectId) -> bool {
        self.resumed && self.previously_ingested.contains(id)
    }

    fn record_created(&self, count: u64) {
        self.created.fetch_add(count, Ordering::Relaxed);
    }
}

/// A staged file ready to be streamed into the repository
struct StagedFile {
    path: PathBuf,
    description: FileDescription,
    techmd_path: PathBuf,
}

/// Ingests the staged content of a deposit into its destination
pub struct IngestContentObjectsJob {
    ctx: JobContext,
    repository: Arc<dyn RepositoryBackend>,
    authorization: Arc<dyn AuthorizationService>,
    metrics: Arc<dyn ThroughputMetrics>,
}

impl IngestContentObjectsJob {
    pub fn new(
        ctx: JobContext,
        repository: Arc<dyn RepositoryBackend>,
        authorization: Arc<dyn AuthorizationService>,
        metrics: Arc<dyn ThroughputMetrics>,
    ) -> Self {
        Self {
            ctx,
            repository,
            authorization,
            metrics,
        }
    }

    /// Check permission and type of the destination before anything is written
    async fn resolve_destination(
        &self,
        destination: &ObjectId,
        principal_groups: &[String],
    ) -> Result<Container, JobError> {
        let allowed = self
            .authorization
            .has_permission(principal_groups, destination, Permission::Ingest)
            .await
            .context("Failed to check ingest permission")?;
        if !allowed {
            return Err(self.ctx.fail_job(
                format!("Insufficient permissions to ingest into {}", destination),
                format!(
                    "Depositor of {} with groups [{}] lacks {} permission on destination {}",
                    self.ctx.deposit_id,
                    principal_groups.join(", "),
                    Permission::Ingest.as_str(),
                    destination
                ),
            ));
        }

        let object = match self.repository.get(destination).await {
            Ok(object) => object,
            Err(RepositoryError::NotFound(_)) => {
                return Err(self.ctx.fail_job(
                    format!("Destination {} does not exist", destination),
                    format!(
                        "Deposit {} targets {}, which is not in the repository",
                        self.ctx.deposit_id, destination
                    ),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        if !object.object_type.is_container() {
            return Err(self.ctx.fail_job(
                format!("Invalid destination {}", destination),
                format!(
                    "Destination {} is a {}, content can only be added to folders and works",
                    destination, object.object_type
                ),
            ));
        }
        Ok(Container::from(&object))
    }

    /// Ids of staged resources already present in the repository
    async fn previously_ingested(&self, ids: &[ObjectId]) -> Result<HashSet<ObjectId>, JobError> {
        let mut present = HashSet::new();
        for id in ids {
            if self.repository.exists(id).await? {
                present.insert(id.clone());
            }
        }
        Ok(present)
    }

    fn ingest_children<'a>(
        &'a self,
        walk: &'a Walk<'a>,
        destination: &'a Container,
        parent: &'a StagedResource,
    ) -> BoxFuture<'a, Result<(), JobError>> {
        async move {
            for child in walk.graph.children(parent)? {
                self.ctx.verify_running().await?;

                match child.resource_type {
                    ResourceType::Folder | ResourceType::Work => {
                        self.ingest_container(walk, destination, child).await?
                    }
                    ResourceType::File if destination.object_type == ObjectType::Work => {
                        self.ingest_file_in_work(walk, destination, child).await?
                    }
                    ResourceType::File => self.ingest_standalone_file(walk, destination, child).await?,
                    ResourceType::Deposit => {
                        return Err(self.ctx.fail_job(
                            format!("Unexpected deposit {} inside deposit content", child.id),
                            format!("Child {} of {} is typed as a deposit", child.id, parent.id),
                        ))
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Folder or work: create or reuse, recurse, then link the primary object
    async fn ingest_container(
        &self,
        walk: &Walk<'_>,
        destination: &Container,
        resource: &StagedResource,
    ) -> Result<(), JobError> {
        let (container, has_primary) = if walk.was_ingested(&resource.id) {
            let existing = self.repository.get(&resource.id).await?;
            debug!(
                resource = %resource.id,
                resource_type = %resource.resource_type,
                "Already ingested, resuming below it"
            );
            (Container::from(&existing), existing.primary_object.is_some())
        } else {
            (self.create_container(walk, destination, resource).await?, false)
        };

        self.ingest_children(walk, &container, resource).await?;

        if resource.resource_type == ResourceType::Work && !has_primary {
            self.link_primary_object(resource).await?;
        }
        Ok(())
    }

    async fn create_container(
        &self,
        walk: &Walk<'_>,
        destination: &Container,
        resource: &StagedResource,
    ) -> Result<Container, JobError> {
        let description =
            ObjectDescription::titled(resource.label()).with_original_deposit(&self.ctx.deposit_id);
        let object_type = match resource.resource_type {
            ResourceType::Folder => ObjectType::Folder,
            _ => ObjectType::Work,
        };

        let mut tx = self.repository.begin().await?;
        let outcome: Result<(), JobError> = async {
            match object_type {
                ObjectType::Folder => tx.create_folder(&resource.id, description).await?,
                _ => tx.create_work(&resource.id, description).await?,
            }
            tx.add_member(&destination.id, &resource.id).await?;
            Ok(())
        }
        .await;
        finish_transaction(tx, outcome).await?;

        walk.record_created(1);
        self.add_completed(1).await?;
        debug!(
            resource = %resource.id,
            resource_type = %object_type,
            parent = %destination.id,
            "Created container"
        );

        Ok(Container {
            id: resource.id.clone(),
            object_type,
        })
    }

    async fn link_primary_object(&self, work: &StagedResource) -> Result<(), JobError> {
        let Some(primary) = &work.properties.primary_object else {
            return Ok(());
        };

        // The primary object was created by the recursion under its staged id.
        if !self.repository.exists(primary).await? {
            return Err(self.ctx.fail_job(
                format!("Primary object {} of work {} was not ingested", primary, work.id),
                format!(
                    "Work {} declares {} as its primary object but no such file exists",
                    work.id, primary
                ),
            ));
        }

        let mut tx = self.repository.begin().await?;
        let outcome: Result<(), JobError> = async {
            tx.set_primary_object(&work.id, primary).await?;
            Ok(())
        }
        .await;
        finish_transaction(tx, outcome).await?;

        debug!(work = %work.id, primary = %primary, "Linked primary object");
        Ok(())
    }

    async fn ingest_file_in_work(
        &self,
        walk: &Walk<'_>,
        work: &Container,
        resource: &StagedResource,
    ) -> Result<(), JobError> {
        if walk.was_ingested(&resource.id) {
            debug!(resource = %resource.id, "File already ingested, skipping");
            return Ok(());
        }

        let staged = self.prepare_file(resource, Some(&work.id))?;

        let mut tx = self.repository.begin().await?;
        let outcome = self
            .attach_file(tx.as_mut(), &work.id, &resource.id, &staged)
            .await;
        let size = finish_transaction(tx, outcome).await?;

        self.metrics.record_bytes(&self.ctx.deposit_id, size);
        walk.record_created(1);
        self.add_completed(1).await?;
        debug!(resource = %resource.id, work = %work.id, size, "Ingested file");
        Ok(())
    }

    async fn ingest_standalone_file(
        &self,
        walk: &Walk<'_>,
        destination: &Container,
        resource: &StagedResource,
    ) -> Result<(), JobError> {
        if walk.was_ingested(&resource.id) {
            debug!(resource = %resource.id, "Standalone file already ingested, skipping");
            return Ok(());
        }

        let staged = self.prepare_file(resource, None)?;
        let work_id = ObjectId::mint();
        let title = resource
            .label()
            .map(str::to_string)
            .unwrap_or_else(|| staged.description.filename.clone());
        let description =
            ObjectDescription::titled(Some(&title)).with_original_deposit(&self.ctx.deposit_id);

        let mut tx = self.repository.begin().await?;
        let outcome: Result<u64, JobError> = async {
            tx.create_work(&work_id, description).await?;
            tx.add_member(&destination.id, &work_id).await?;
            let size = self
                .attach_file(tx.as_mut(), &work_id, &resource.id, &staged)
                .await?;
            tx.set_primary_object(&work_id, &resource.id).await?;
            Ok(size)
        }
        .await;
        let size = finish_transaction(tx, outcome).await?;

        self.metrics.record_bytes(&self.ctx.deposit_id, size);
        walk.record_created(2);
        self.add_completed(1).await?;
        debug!(
            resource = %resource.id,
            work = %work_id,
            parent = %destination.id,
            size,
            "Ingested standalone file in a new work"
        );
        Ok(())
    }

    /// Resolve location, filename and side report of a staged file
    fn prepare_file(
        &self,
        resource: &StagedResource,
        work: Option<&ObjectId>,
    ) -> Result<StagedFile, JobError> {
        let properties = &resource.properties;
        let Some(location) = properties.staging_location.as_deref() else {
            let context = match work {
                Some(work) => format!(" in work {}", work),
                None => String::new(),
            };
            return Err(self.ctx.fail_job(
                format!("No staging location provided for file {}", resource.id),
                format!(
                    "File {}{} of deposit {} has no staging location",
                    resource.id, context, self.ctx.deposit_id
                ),
            ));
        };

        let filename = properties
            .filename
            .clone()
            .or_else(|| staged_file_name(location))
            .unwrap_or_else(|| resource.id.to_string());

        Ok(StagedFile {
            path: resolve_staging_location(&self.ctx.deposit_dir(), location),
            description: FileDescription {
                filename,
                mimetype: properties.mimetype.clone(),
                checksums: properties.checksums.clone(),
                original_deposit: Some(self.ctx.deposit_id.clone()),
            },
            techmd_path: report_path(&self.ctx.techmd_dir(), &resource.id),
        })
    }

    /// Stream a staged file and its report into `tx` as a member of `work`
    ///
    /// Returns the byte length of the staged file.
    async fn attach_file(
        &self,
        tx: &mut dyn RepositoryTransaction,
        work: &ObjectId,
        file_id: &ObjectId,
        staged: &StagedFile,
    ) -> Result<u64, JobError> {
        let content = tokio::fs::File::open(&staged.path).await.map_err(|e| {
            self.ctx.fail_job_with(
                &e,
                format!(
                    "Unable to open staged file {} for {}",
                    staged.path.display(),
                    file_id
                ),
            )
        })?;
        let size = content.metadata().await?.len();

        tx.create_file_object(file_id, staged.description.clone(), Box::new(content))
            .await?;
        tx.add_member(work, file_id).await?;

        let report = match tokio::fs::File::open(&staged.techmd_path).await {
            Ok(report) => report,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(self.ctx.fail_job(
                    format!("Technical metadata report missing for file {}", file_id),
                    format!(
                        "Expected the report of {} at {}",
                        file_id,
                        staged.techmd_path.display()
                    ),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        tx.add_binary(file_id, TECHNICAL_METADATA, Some(TECHMD_MIMETYPE), Box::new(report))
            .await?;

        Ok(size)
    }

    async fn add_completed(&self, units: u64) -> Result<(), JobError> {
        self.ctx
            .status
            .increment_completed(&self.ctx.job_id, units)
            .await
            .context("Failed to update completed units")?;
        Ok(())
    }
}

#[async_trait]
impl DepositJob for IngestContentObjectsJob {
    fn name(&self) -> &str {
        "ingest_content"
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

        let destination = self
            .resolve_destination(&deposit.destination, &deposit.principal_groups)
            .await?;

        let graph = model.graph();
        let ids = graph.pre_order_ids();
        ctx.status
            .set_total_units(&ctx.job_id, ids.len() as u64)
            .await
            .context("Failed to set total units")?;

        let previously_ingested = if deposit.resumed {
            self.previously_ingested(&ids).await?
        } else {
            HashSet::new()
        };
        ctx.status
            .set_completed_units(&ctx.job_id, previously_ingested.len() as u64)
            .await
            .context("Failed to set completed units")?;

        info!(
            job_id = %ctx.job_id,
            deposit_id = %ctx.deposit_id,
            destination = %destination.id,
            total_units = ids.len(),
            resumed = deposit.resumed,
            already_ingested = previously_ingested.len(),
            "Ingesting deposit content"
        );

        let walk = Walk {
            graph,
            resumed: deposit.resumed,
            previously_ingested,
            created: AtomicU64::new(0),
        };
        self.ingest_children(&walk, &destination, graph.root()).await?;

        info!(
            job_id = %ctx.job_id,
            deposit_id = %ctx.deposit_id,
            created = walk.created.load(Ordering::Relaxed),
            "Deposit content ingested"
        );
        Ok(())
    }
}
