//! In-memory repository backend
//!
//! Transactions record operations and apply them in one step on commit,
//! against an overlay of the objects they touch. A failing operation leaves
//! the store exactly as it was.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncReadExt;
use tracing::debug;

use deposit_common::ObjectId;

use super::{
    BinaryContent, FileDescription, ObjectDescription, ObjectType, RepositoryBackend,
    RepositoryObject, RepositoryTransaction, StoredBinary, ORIGINAL_FILE,
};
use crate::error::RepositoryError;

#[derive(Debug, Default)]
struct RepositoryState {
    objects: HashMap<ObjectId, RepositoryObject>,
    creations: HashMap<ObjectId, usize>,
    failing: HashSet<ObjectId>,
    commits: usize,
    cancels: usize,
}

impl RepositoryState {
    fn lookup<'a>(
        &'a self,
        overlay: &'a HashMap<ObjectId, RepositoryObject>,
        id: &ObjectId,
    ) -> Option<&'a RepositoryObject> {
        overlay.get(id).or_else(|| self.objects.get(id))
    }

    /// Copy an object into the overlay so it can be modified
    fn stage<'a>(
        &self,
        overlay: &'a mut HashMap<ObjectId, RepositoryObject>,
        id: &ObjectId,
    ) -> Result<&'a mut RepositoryObject, RepositoryError> {
        if !overlay.contains_key(id) {
            let object = self
                .objects
                .get(id)
                .cloned()
                .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
            overlay.insert(id.clone(), object);
        }
        overlay
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))
    }

    fn apply(
        &self,
        overlay: &mut HashMap<ObjectId, RepositoryObject>,
        op: Operation,
    ) -> Result<(), RepositoryError> {
        for id in op.touched() {
            if self.failing.contains(id) {
                return Err(RepositoryError::Backend(format!(
                    "injected failure while writing {}",
                    id
                )));
            }
        }

        match op {
            Operation::Create(object) => {
                if self.lookup(overlay, &object.id).is_some() {
                    return Err(RepositoryError::AlreadyExists(object.id));
                }
                overlay.insert(object.id.clone(), *object);
            }
            Operation::UpdateProperties { id, description } => {
                self.stage(overlay, &id)?.description = description;
            }
            Operation::AddMember { parent, child } => {
                let parent_type = self
                    .lookup(overlay, &parent)
                    .map(|o| o.object_type)
                    .ok_or_else(|| RepositoryError::NotFound(parent.clone()))?;
                let child_object = self
                    .lookup(overlay, &child)
                    .ok_or_else(|| RepositoryError::NotFound(child.clone()))?;
                check_membership(&parent, parent_type, child_object)?;

                self.stage(overlay, &child)?.parent = Some(parent.clone());
                let parent_object = self.stage(overlay, &parent)?;
                if !parent_object.members.contains(&child) {
                    parent_object.members.push(child);
                }
            }
            Operation::SetPrimaryObject { work, file } => {
                let work_object = self
                    .lookup(overlay, &work)
                    .ok_or_else(|| RepositoryError::NotFound(work.clone()))?;
                if work_object.object_type != ObjectType::Work {
                    return Err(RepositoryError::Backend(format!(
                        "{} is a {}, only works have a primary object",
                        work, work_object.object_type
                    )));
                }
                if !work_object.members.contains(&file) {
                    return Err(RepositoryError::InvalidMembership {
                        parent: work.clone(),
                        child: file,
                        reason: "primary object must be a member of the work".to_string(),
                    });
                }
                self.stage(overlay, &work)?.primary_object = Some(file);
            }
            Operation::AddBinary { id, binary } => {
                let object = self.stage(overlay, &id)?;
                object.binaries.retain(|b| b.name != binary.name);
                object.binaries.push(binary);
            }
        }
        Ok(())
    }
}

fn check_membership(
    parent: &ObjectId,
    parent_type: ObjectType,
    child: &RepositoryObject,
) -> Result<(), RepositoryError> {
    let invalid = |reason: String| RepositoryError::InvalidMembership {
        parent: parent.clone(),
        child: child.id.clone(),
        reason,
    };

    match parent_type {
        ObjectType::Work if child.object_type != ObjectType::File => Err(invalid(format!(
            "a work only accepts files, got a {}",
            child.object_type
        ))),
        ObjectType::Folder if child.object_type == ObjectType::File => {
            Err(invalid("a folder cannot hold files directly".to_string()))
        }
        ObjectType::File | ObjectType::DepositRecord => {
            Err(invalid(format!("a {} cannot have members", parent_type)))
        }
        _ => match &child.parent {
            Some(existing) if existing != parent => {
                Err(invalid(format!("already a member of {}", existing)))
            }
            _ => Ok(()),
        },
    }
}

#[derive(Debug)]
enum Operation {
    Create(Box<RepositoryObject>),
    UpdateProperties {
        id: ObjectId,
        description: ObjectDescription,
    },
    AddMember {
        parent: ObjectId,
        child: ObjectId,
    },
    SetPrimaryObject {
        work: ObjectId,
        file: ObjectId,
    },
    AddBinary {
        id: ObjectId,
        binary: StoredBinary,
    },
}

impl Operation {
    fn touched(&self) -> Vec<&ObjectId> {
        match self {
            Operation::Create(object) => vec![&object.id],
            Operation::UpdateProperties { id, .. } | Operation::AddBinary { id, .. } => vec![id],
            Operation::AddMember { parent, child } => vec![parent, child],
            Operation::SetPrimaryObject { work, file } => vec![work, file],
        }
    }
}

/// Object store held in process memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<RepositoryState>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RepositoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an object directly, outside any transaction
    pub fn seed(&self, object: RepositoryObject) {
        self.lock().objects.insert(object.id.clone(), object);
    }

    /// Insert an empty top-level folder
    pub fn seed_folder(&self, id: &ObjectId) {
        self.seed(RepositoryObject::new(
            id.clone(),
            ObjectType::Folder,
            ObjectDescription::default(),
        ));
    }

    /// Make every later commit touching `id` fail
    pub fn fail_on(&self, id: &ObjectId) {
        self.lock().failing.insert(id.clone());
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    pub fn object(&self, id: &ObjectId) -> Option<RepositoryObject> {
        self.lock().objects.get(id).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Number of committed creations of `id`
    pub fn creation_count(&self, id: &ObjectId) -> usize {
        self.lock().creations.get(id).copied().unwrap_or(0)
    }

    /// Number of committed creations across all ids
    pub fn total_creations(&self) -> usize {
        self.lock().creations.values().sum()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    pub fn cancel_count(&self) -> usize {
        self.lock().cancels
    }
}

#[async_trait]
impl RepositoryBackend for InMemoryRepository {
    async fn exists(&self, id: &ObjectId) -> Result<bool, RepositoryError> {
        Ok(self.lock().objects.contains_key(id))
    }

    async fn get(&self, id: &ObjectId) -> Result<RepositoryObject, RepositoryError> {
        self.object(id)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))
    }

    async fn begin(&self) -> Result<Box<dyn RepositoryTransaction>, RepositoryError> {
        Ok(Box::new(MemoryTransaction {
            repository: self.clone(),
            operations: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    repository: InMemoryRepository,
    operations: Vec<Operation>,
}

impl MemoryTransaction {
    fn create(&mut self, id: &ObjectId, object_type: ObjectType, description: ObjectDescription) {
        self.operations.push(Operation::Create(Box::new(RepositoryObject::new(
            id.clone(),
            object_type,
            description,
        ))));
    }
}

async fn store_binary(
    name: &str,
    mimetype: Option<&str>,
    mut content: BinaryContent,
) -> Result<StoredBinary, RepositoryError> {
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = content.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(StoredBinary {
        name: name.to_string(),
        mimetype: mimetype.map(str::to_string),
        size,
        sha256: hex::encode(hasher.finalize()),
    })
}

#[async_trait]
impl RepositoryTransaction for MemoryTransaction {
    async fn create_folder(
        &mut self,
        id: &ObjectId,
        description: ObjectDescription,
    ) -> Result<(), RepositoryError> {
        self.create(id, ObjectType::Folder, description);
        Ok(())
    }

    async fn create_work(
        &mut self,
        id: &ObjectId,
        description: ObjectDescription,
    ) -> Result<(), RepositoryError> {
        self.create(id, ObjectType::Work, description);
        Ok(())
    }

    async fn create_file_object(
        &mut self,
        id: &ObjectId,
        description: FileDescription,
        content: BinaryContent,
    ) -> Result<StoredBinary, RepositoryError> {
        let binary = store_binary(ORIGINAL_FILE, description.mimetype.as_deref(), content).await?;

        let mut object = RepositoryObject::new(
            id.clone(),
            ObjectType::File,
            ObjectDescription {
                title: Some(description.filename.clone()),
                original_deposit: description.original_deposit.clone(),
                ..Default::default()
            },
        );
        object.file = Some(description);
        object.binaries.push(binary.clone());
        self.operations.push(Operation::Create(Box::new(object)));
        Ok(binary)
    }

    async fn create_deposit_record(
        &mut self,
        id: &ObjectId,
        description: ObjectDescription,
    ) -> Result<(), RepositoryError> {
        self.create(id, ObjectType::DepositRecord, description);
        Ok(())
    }

    async fn update_properties(
        &mut self,
        id: &ObjectId,
        description: ObjectDescription,
    ) -> Result<(), RepositoryError> {
        self.operations.push(Operation::UpdateProperties {
            id: id.clone(),
            description,
        });
        Ok(())
    }

    async fn add_member(
        &mut self,
        parent: &ObjectId,
        child: &ObjectId,
    ) -> Result<(), RepositoryError> {
        self.operations.push(Operation::AddMember {
            parent: parent.clone(),
            child: child.clone(),
        });
        Ok(())
    }

    async fn set_primary_object(
        &mut self,
        work: &ObjectId,
        file: &ObjectId,
    ) -> Result<(), RepositoryError> {
        self.operations.push(Operation::SetPrimaryObject {
            work: work.clone(),
            file: file.clone(),
        });
        Ok(())
    }

    async fn add_binary(
        &mut self,
        id: &ObjectId,
        name: &str,
        mimetype: Option<&str>,
        content: BinaryContent,
    ) -> Result<StoredBinary, RepositoryError> {
        let binary = store_binary(name, mimetype, content).await?;
        self.operations.push(Operation::AddBinary {
            id: id.clone(),
            binary: binary.clone(),
        });
        Ok(binary)
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        let MemoryTransaction {
            repository,
            operations,
        } = *self;
        let mut state = repository.lock();

        let mut created = Vec::new();
        let mut overlay = HashMap::new();
        let operation_count = operations.len();
        for op in operations {
            if let Operation::Create(object) = &op {
                created.push(object.id.clone());
            }
            state.apply(&mut overlay, op)?;
        }

        state.objects.extend(overlay);
        for id in created {
            *state.creations.entry(id).or_insert(0) += 1;
        }
        state.commits += 1;

        debug!(operations = operation_count, "Committed repository transaction");
        Ok(())
    }

    async fn cancel(self: Box<Self>, reason: &str) -> Result<(), RepositoryError> {
        let discarded = self.operations.len();
        self.repository.lock().cancels += 1;
        debug!(discarded, reason, "Cancelled repository transaction");
        Ok(())
    }
}
