//! In-process collaborator implementations
//!
//! Used by the rehearsal command and by tests. None of them persist anything.

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use tokio::io::AsyncReadExt;

use deposit_common::{DepositId, JobId, ObjectId};

use super::{
    AuthorizationService, DepositState, DepositStatus, JobFailure, JobProgress, JobState,
    Permission, ProvenanceEvent, ProvenanceLog, StatusStore, TechnicalMetadataExtractor,
    ThroughputMetrics,
};

#[derive(Debug, Default)]
struct StatusTables {
    deposits: HashMap<DepositId, DepositStatus>,
    jobs: HashMap<JobId, JobProgress>,
}

/// Status store backed by process memory
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    tables: Mutex<StatusTables>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a deposit's status
    pub fn register_deposit(&self, status: DepositStatus) {
        let mut tables = self.lock();
        tables.deposits.insert(status.deposit_id.clone(), status);
    }

    /// Flag a deposit as resumed, as an operator restart would
    pub fn set_resumed(&self, deposit_id: &DepositId, resumed: bool) {
        if let Some(status) = self.lock().deposits.get_mut(deposit_id) {
            status.resumed = resumed;
        }
    }

    pub fn deposit(&self, deposit_id: &DepositId) -> Option<DepositStatus> {
        self.lock().deposits.get(deposit_id).cloned()
    }

    pub fn job(&self, job_id: &JobId) -> Option<JobProgress> {
        self.lock().jobs.get(job_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_job(&self, job_id: &JobId, update: impl FnOnce(&mut JobProgress)) {
        let mut tables = self.lock();
        let progress = tables.jobs.entry(*job_id).or_insert_with(|| JobProgress {
            state: JobState::Queued,
            total_units: 0,
            completed_units: 0,
            failure: None,
        });
        update(progress);
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn get_deposit(&self, deposit_id: &DepositId) -> anyhow::Result<DepositStatus> {
        self.deposit(deposit_id)
            .ok_or_else(|| anyhow::anyhow!("Deposit {} is not registered", deposit_id))
    }

    async fn set_deposit_state(
        &self,
        deposit_id: &DepositId,
        state: DepositState,
    ) -> anyhow::Result<()> {
        let mut tables = self.lock();
        let status = tables
            .deposits
            .get_mut(deposit_id)
            .ok_or_else(|| anyhow::anyhow!("Deposit {} is not registered", deposit_id))?;
        status.state = state;
        Ok(())
    }

    async fn set_total_units(&self, job_id: &JobId, total: u64) -> anyhow::Result<()> {
        self.update_job(job_id, |p| p.total_units = total);
        Ok(())
    }

    async fn set_completed_units(&self, job_id: &JobId, completed: u64) -> anyhow::Result<()> {
        self.update_job(job_id, |p| p.completed_units = completed);
        Ok(())
    }

    async fn increment_completed(&self, job_id: &JobId, delta: u64) -> anyhow::Result<()> {
        self.update_job(job_id, |p| p.completed_units += delta);
        Ok(())
    }

    async fn set_job_state(&self, job_id: &JobId, state: JobState) -> anyhow::Result<()> {
        self.update_job(job_id, |p| p.state = state);
        Ok(())
    }

    async fn record_job_failure(
        &self,
        job_id: &JobId,
        message: &str,
        details: Option<&str>,
    ) -> anyhow::Result<()> {
        self.update_job(job_id, |p| {
            p.state = JobState::Failed;
            p.failure = Some(JobFailure {
                message: message.to_string(),
                details: details.map(str::to_string),
            });
        });
        Ok(())
    }

    async fn job_progress(&self, job_id: &JobId) -> anyhow::Result<Option<JobProgress>> {
        Ok(self.job(job_id))
    }
}

/// Grants every permission to members of a fixed set of groups
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorization {
    allowed_groups: HashSet<String>,
    allow_all: bool,
}

impl StaticAuthorization {
    pub fn new<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_groups: groups.into_iter().map(Into::into).collect(),
            allow_all: false,
        }
    }

    pub fn allow_all() -> Self {
        Self {
            allowed_groups: HashSet::new(),
            allow_all: true,
        }
    }
}

#[async_trait]
impl AuthorizationService for StaticAuthorization {
    async fn has_permission(
        &self,
        principal_groups: &[String],
        target: &ObjectId,
        permission: Permission,
    ) -> anyhow::Result<bool> {
        let granted =
            self.allow_all || principal_groups.iter().any(|g| self.allowed_groups.contains(g));
        tracing::trace!(
            target = %target,
            permission = permission.as_str(),
            granted,
            "Checked permission"
        );
        Ok(granted)
    }
}

/// Sums transferred bytes per deposit
#[derive(Debug, Default)]
pub struct ThroughputCounter {
    bytes: Mutex<HashMap<DepositId, u64>>,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_for(&self, deposit_id: &DepositId) -> u64 {
        self.bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(deposit_id)
            .copied()
            .unwrap_or(0)
    }
}

impl ThroughputMetrics for ThroughputCounter {
    fn record_bytes(&self, deposit_id: &DepositId, bytes: u64) {
        *self
            .bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(deposit_id.clone())
            .or_insert(0) += bytes;
    }
}

/// Keeps provenance events in append order
#[derive(Debug, Default)]
pub struct MemoryProvenanceLog {
    events: Mutex<Vec<(ObjectId, ProvenanceEvent)>>,
}

impl MemoryProvenanceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_for(&self, object_id: &ObjectId) -> Vec<ProvenanceEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(id, _)| id == object_id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProvenanceLog for MemoryProvenanceLog {
    async fn append_event(
        &self,
        object_id: &ObjectId,
        event: ProvenanceEvent,
    ) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((object_id.clone(), event));
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename = "techmd")]
struct DigestReport {
    filename: String,
    size: u64,
    sha256: String,
}

/// Minimal extractor reporting a file's size and SHA-256 digest
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestReportExtractor;

#[async_trait]
impl TechnicalMetadataExtractor for DigestReportExtractor {
    async fn extract(&self, staged_file: &Path) -> anyhow::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(staged_file)
            .await
            .with_context(|| format!("Cannot open {} for extraction", staged_file.display()))?;

        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        let report = DigestReport {
            filename: staged_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size,
            sha256: hex::encode(hasher.finalize()),
        };
        let xml = quick_xml::se::to_string(&report)
            .context("Failed to serialize technical metadata report")?;
        Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}\n", xml).into_bytes())
    }
}
