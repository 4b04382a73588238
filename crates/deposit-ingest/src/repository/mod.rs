//! Repository backend abstraction
//!
//! The object store that deposits are materialized into. Every mutation goes
//! through a [`RepositoryTransaction`]; nothing a transaction does is visible
//! until `commit`, and `cancel` leaves the repository untouched.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use tokio::io::AsyncRead;
use tracing::warn;

use deposit_common::{DepositId, ObjectId};

use crate::error::RepositoryError;
use crate::model::Checksum;

pub use memory::InMemoryRepository;

/// Binary name of a file object's payload
pub const ORIGINAL_FILE: &str = "original_file";

/// Binary name of the technical metadata report attached to a file object
pub const TECHNICAL_METADATA: &str = "techmd_report";

/// Prefix of manifest binaries on a deposit record
pub const MANIFEST_PREFIX: &str = "manifest:";

/// Streamed binary content
pub type BinaryContent = Box<dyn AsyncRead + Send + Unpin>;

/// Type of a materialized object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Folder,
    Work,
    File,
    DepositRecord,
}

impl ObjectType {
    pub fn as_str(&self) -> &str {
        match self {
            ObjectType::Folder => "folder",
            ObjectType::Work => "work",
            ObjectType::File => "file",
            ObjectType::DepositRecord => "deposit_record",
        }
    }

    /// Whether objects of this type can be the destination of a deposit
    pub fn is_container(&self) -> bool {
        matches!(self, ObjectType::Folder | ObjectType::Work)
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal descriptive properties of an object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescription {
    pub title: Option<String>,
    /// Deposit the object was created by
    pub original_deposit: Option<DepositId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl ObjectDescription {
    pub fn titled(title: Option<&str>) -> Self {
        Self {
            title: title.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn with_original_deposit(mut self, deposit_id: &DepositId) -> Self {
        self.original_deposit = Some(deposit_id.clone());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Properties of a file object's payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescription {
    pub filename: String,
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checksums: Vec<Checksum>,
    pub original_deposit: Option<DepositId>,
}

/// A binary stored on an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBinary {
    pub name: String,
    pub mimetype: Option<String>,
    pub size: u64,
    /// Hex-encoded SHA-256 of the content
    pub sha256: String,
}

/// Materialized object as seen by readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryObject {
    pub id: ObjectId,
    pub object_type: ObjectType,
    pub parent: Option<ObjectId>,
    pub description: ObjectDescription,
    pub file: Option<FileDescription>,
    pub primary_object: Option<ObjectId>,
    /// Members in display order
    pub members: Vec<ObjectId>,
    pub binaries: Vec<StoredBinary>,
}

impl RepositoryObject {
    pub fn new(id: ObjectId, object_type: ObjectType, description: ObjectDescription) -> Self {
        Self {
            id,
            object_type,
            parent: None,
            description,
            file: None,
            primary_object: None,
            members: Vec::new(),
            binaries: Vec::new(),
        }
    }

    pub fn binary(&self, name: &str) -> Option<&StoredBinary> {
        self.binaries.iter().find(|b| b.name == name)
    }

    pub fn title(&self) -> Option<&str> {
        self.description.title.as_deref()
    }
}

/// Read access and transaction factory for the object store
#[async_trait]
pub trait RepositoryBackend: Send + Sync {
    async fn exists(&self, id: &ObjectId) -> Result<bool, RepositoryError>;

    async fn get(&self, id: &ObjectId) -> Result<RepositoryObject, RepositoryError>;

    /// Member ids of a container in display order
    async fn members(&self, id: &ObjectId) -> Result<Vec<ObjectId>, RepositoryError> {
        Ok(self.get(id).await?.members)
    }

    async fn begin(&self) -> Result<Box<dyn RepositoryTransaction>, RepositoryError>;
}

/// A scoped unit of mutations
#[async_trait]
pub trait RepositoryTransaction: Send {
    async fn create_folder(
        &mut self,
        id: &ObjectId,
        description: ObjectDescription,
    ) -> Result<(), RepositoryError>;

    async fn create_work(
        &mut self,
        id: &ObjectId,
        description: ObjectDescription,
    ) -> Result<(), RepositoryError>;

    /// Create a file object whose payload is streamed from `content`
    async fn create_file_object(
        &mut self,
        id: &ObjectId,
        description: FileDescription,
        content: BinaryContent,
    ) -> Result<StoredBinary, RepositoryError>;

    async fn create_deposit_record(
        &mut self,
        id: &ObjectId,
        description: ObjectDescription,
    ) -> Result<(), RepositoryError>;

    /// Replace an existing object's description
    async fn update_properties(
        &mut self,
        id: &ObjectId,
        description: ObjectDescription,
    ) -> Result<(), RepositoryError>;

    async fn add_member(&mut self, parent: &ObjectId, child: &ObjectId)
        -> Result<(), RepositoryError>;

    async fn set_primary_object(
        &mut self,
        work: &ObjectId,
        file: &ObjectId,
    ) -> Result<(), RepositoryError>;

    /// Attach a named binary, replacing any binary of the same name
    async fn add_binary(
        &mut self,
        id: &ObjectId,
        name: &str,
        mimetype: Option<&str>,
        content: BinaryContent,
    ) -> Result<StoredBinary, RepositoryError>;

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;

    async fn cancel(self: Box<Self>, reason: &str) -> Result<(), RepositoryError>;
}

/// Commit `tx` when `outcome` succeeded, cancel it otherwise
///
/// A failed cancel is logged and the original error is returned.
pub async fn finish_transaction<T, E>(
    tx: Box<dyn RepositoryTransaction>,
    outcome: Result<T, E>,
) -> Result<T, E>
where
    E: From<RepositoryError> + Display,
{
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(cancel_err) = tx.cancel(&err.to_string()).await {
                warn!(error = %cancel_err, cause = %err, "Failed to cancel repository transaction");
            }
            Err(err)
        }
    }
}
