//! External collaborators consumed by deposit jobs
//!
//! The status store, authorization, throughput metrics, provenance log and
//! technical metadata extraction live outside this crate. Jobs talk to them
//! through the traits below; [`memory`] holds in-process implementations.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use deposit_common::{DepositId, JobId, ObjectId};

/// Lifecycle state of a deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositState {
    Registered,
    Running,
    /// An operator asked for the deposit to stop
    Paused,
    Failed,
    Completed,
}

impl DepositState {
    pub fn as_str(&self) -> &str {
        match self {
            DepositState::Registered => "registered",
            DepositState::Running => "running",
            DepositState::Paused => "paused",
            DepositState::Failed => "failed",
            DepositState::Completed => "completed",
        }
    }

    /// Failed and completed deposits never change state again
    pub fn is_terminal(&self) -> bool {
        matches!(self, DepositState::Failed | DepositState::Completed)
    }
}

impl std::fmt::Display for DepositState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a single job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Interrupted,
}

/// Deposit fields tracked by the status store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositStatus {
    pub deposit_id: DepositId,
    pub state: DepositState,
    /// Container the deposit's content is ingested into
    pub destination: ObjectId,
    /// Groups of the principal that submitted the deposit
    pub principal_groups: Vec<String>,
    /// Set when an operator restarts a deposit that already ran
    pub resumed: bool,
    pub label: Option<String>,
    pub depositor_name: Option<String>,
    pub deposit_method: Option<String>,
    pub packaging_profile: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl DepositStatus {
    pub fn new(deposit_id: DepositId, destination: ObjectId) -> Self {
        Self {
            deposit_id,
            state: DepositState::Registered,
            destination,
            principal_groups: Vec::new(),
            resumed: false,
            label: None,
            depositor_name: None,
            deposit_method: None,
            packaging_profile: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.principal_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_depositor(mut self, name: impl Into<String>) -> Self {
        self.depositor_name = Some(name.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.deposit_method = Some(method.into());
        self
    }

    pub fn with_packaging_profile(mut self, profile: impl Into<String>) -> Self {
        self.packaging_profile = Some(profile.into());
        self
    }
}

/// Failure recorded against a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub details: Option<String>,
}

/// Progress snapshot of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub state: JobState,
    pub total_units: u64,
    pub completed_units: u64,
    pub failure: Option<JobFailure>,
}

impl JobProgress {
    pub fn completion_percentage(&self) -> f64 {
        if self.total_units == 0 {
            return 0.0;
        }
        (self.completed_units as f64 / self.total_units as f64) * 100.0
    }
}

/// Distributed store of deposit and job progress
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get_deposit(&self, deposit_id: &DepositId) -> anyhow::Result<DepositStatus>;

    async fn get_deposit_state(&self, deposit_id: &DepositId) -> anyhow::Result<DepositState> {
        Ok(self.get_deposit(deposit_id).await?.state)
    }

    async fn is_resumed(&self, deposit_id: &DepositId) -> anyhow::Result<bool> {
        Ok(self.get_deposit(deposit_id).await?.resumed)
    }

    async fn set_deposit_state(&self, deposit_id: &DepositId, state: DepositState)
        -> anyhow::Result<()>;

    async fn set_total_units(&self, job_id: &JobId, total: u64) -> anyhow::Result<()>;

    async fn set_completed_units(&self, job_id: &JobId, completed: u64) -> anyhow::Result<()>;

    async fn increment_completed(&self, job_id: &JobId, delta: u64) -> anyhow::Result<()>;

    async fn set_job_state(&self, job_id: &JobId, state: JobState) -> anyhow::Result<()>;

    async fn record_job_failure(
        &self,
        job_id: &JobId,
        message: &str,
        details: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn job_progress(&self, job_id: &JobId) -> anyhow::Result<Option<JobProgress>>;
}

/// Permissions checked before a deposit touches the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Ingest,
}

impl Permission {
    pub fn as_str(&self) -> &str {
        match self {
            Permission::Ingest => "ingest",
        }
    }
}

#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn has_permission(
        &self,
        principal_groups: &[String],
        target: &ObjectId,
        permission: Permission,
    ) -> anyhow::Result<bool>;
}

/// Receives transferred byte counts
pub trait ThroughputMetrics: Send + Sync {
    fn record_bytes(&self, deposit_id: &DepositId, bytes: u64);
}

/// Kind of provenance event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// An object was created from a deposit
    Ingestion,
}

/// Event appended to an object's provenance history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    pub event_type: EventType,
    pub details: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ProvenanceEvent {
    pub fn new(event_type: EventType, details: Vec<String>) -> Self {
        Self {
            event_type,
            details,
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ProvenanceLog: Send + Sync {
    async fn append_event(&self, object_id: &ObjectId, event: ProvenanceEvent)
        -> anyhow::Result<()>;
}

/// Produces a technical metadata report for a staged file
#[async_trait]
pub trait TechnicalMetadataExtractor: Send + Sync {
    async fn extract(&self, staged_file: &Path) -> anyhow::Result<Vec<u8>>;
}
