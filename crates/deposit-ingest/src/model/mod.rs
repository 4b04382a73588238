//! Deposit graph model
//!
//! A deposit is staged as an ordered tree of [`StagedResource`]s rooted at a
//! `Deposit` node. Folders and works carry ordered child lists; the order is
//! the ingestion order and the display order of the resulting hierarchy.
//! Files are always leaves.
//!
//! The graph is held in a [`DepositModelStore`] and mutated only through a
//! [`ModelTransaction`].

pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use deposit_common::ObjectId;

use crate::error::ModelError;

pub use store::{DepositModelStore, ModelTransaction};

/// Declared type of a staged resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// The deposit itself, only valid as the root
    Deposit,
    Folder,
    Work,
    File,
}

impl ResourceType {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceType::Deposit => "deposit",
            ResourceType::Folder => "folder",
            ResourceType::Work => "work",
            ResourceType::File => "file",
        }
    }

    pub fn can_have_children(&self) -> bool {
        !matches!(self, ResourceType::File)
    }

    /// Whether a resource of this type may contain a `child` resource
    ///
    /// Works only hold files; folders and the deposit hold anything but a
    /// deposit.
    pub fn accepts_child(&self, child: ResourceType) -> bool {
        match self {
            ResourceType::Deposit | ResourceType::Folder => child != ResourceType::Deposit,
            ResourceType::Work => child == ResourceType::File,
            ResourceType::File => false,
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checksum declared for a staged file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// Algorithm name, lowercase: "sha1", "md5", "sha256"
    pub algorithm: String,
    /// Hex-encoded digest
    pub value: String,
}

/// Manifest file shipped with a deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub location: String,
    #[serde(default)]
    pub mimetype: Option<String>,
}

/// Property bag of a staged resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Where the staged binary lives: a path relative to the deposit
    /// directory, an absolute path or a `file://` URI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checksums: Vec<Checksum>,
    /// On a work, the child file to use as its primary object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_object: Option<ObjectId>,
    /// On the deposit root, manifests to attach to the deposit record
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<Manifest>,
    /// Passthrough properties
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A node of the staged content graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedResource {
    pub id: ObjectId,
    pub resource_type: ResourceType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ObjectId>,
    #[serde(default)]
    pub properties: ResourceProperties,
}

impl StagedResource {
    pub fn new(id: ObjectId, resource_type: ResourceType) -> Self {
        Self {
            id,
            resource_type,
            children: Vec::new(),
            properties: ResourceProperties::default(),
        }
    }

    pub fn deposit(id: ObjectId) -> Self {
        Self::new(id, ResourceType::Deposit)
    }

    pub fn folder(id: ObjectId) -> Self {
        Self::new(id, ResourceType::Folder)
    }

    pub fn work(id: ObjectId) -> Self {
        Self::new(id, ResourceType::Work)
    }

    pub fn file(id: ObjectId) -> Self {
        Self::new(id, ResourceType::File)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.properties.label = Some(label.into());
        self
    }

    pub fn with_staging_location(mut self, location: impl Into<String>) -> Self {
        self.properties.staging_location = Some(location.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.properties.filename = Some(filename.into());
        self
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.properties.mimetype = Some(mimetype.into());
        self
    }

    pub fn with_checksum(mut self, algorithm: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.checksums.push(Checksum {
            algorithm: algorithm.into().to_lowercase(),
            value: value.into(),
        });
        self
    }

    pub fn with_primary_object(mut self, primary: ObjectId) -> Self {
        self.properties.primary_object = Some(primary);
        self
    }

    pub fn with_manifest(mut self, location: impl Into<String>, mimetype: Option<&str>) -> Self {
        self.properties.manifests.push(Manifest {
            location: location.into(),
            mimetype: mimetype.map(str::to_string),
        });
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.extra.insert(key.into(), value);
        self
    }

    pub fn is_file(&self) -> bool {
        self.resource_type == ResourceType::File
    }

    pub fn label(&self) -> Option<&str> {
        self.properties.label.as_deref()
    }
}

/// Serialized form of a [`DepositGraph`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphDocument {
    root: ObjectId,
    resources: Vec<StagedResource>,
}

/// Ordered, acyclic tree of staged resources rooted at the deposit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GraphDocument", into = "GraphDocument")]
pub struct DepositGraph {
    root: ObjectId,
    resources: BTreeMap<ObjectId, StagedResource>,
}

impl TryFrom<GraphDocument> for DepositGraph {
    type Error = ModelError;

    fn try_from(doc: GraphDocument) -> Result<Self, Self::Error> {
        let mut resources = BTreeMap::new();
        for resource in doc.resources {
            let id = resource.id.clone();
            if resources.insert(id.clone(), resource).is_some() {
                return Err(ModelError::Invalid(format!("duplicate resource id {}", id)));
            }
        }
        let graph = Self {
            root: doc.root,
            resources,
        };
        graph.validate()?;
        Ok(graph)
    }
}

impl From<DepositGraph> for GraphDocument {
    fn from(graph: DepositGraph) -> Self {
        let mut resources = Vec::with_capacity(graph.resources.len());
        let mut by_id = graph.resources;
        // Pre-order keeps the document readable; orphans, if any, follow.
        let order = pre_order(&graph.root, &by_id, true);
        for id in order {
            if let Some(resource) = by_id.remove(&id) {
                resources.push(resource);
            }
        }
        resources.extend(by_id.into_values());
        GraphDocument {
            root: graph.root,
            resources,
        }
    }
}

impl DepositGraph {
    /// Start a graph from its deposit root
    pub fn new(root: StagedResource) -> Result<Self, ModelError> {
        if root.resource_type != ResourceType::Deposit {
            return Err(ModelError::Invalid(format!(
                "root {} must be a deposit, found {}",
                root.id, root.resource_type
            )));
        }
        if !root.children.is_empty() {
            return Err(ModelError::Invalid(
                "children must be added with add_child".to_string(),
            ));
        }
        let id = root.id.clone();
        let mut resources = BTreeMap::new();
        resources.insert(id.clone(), root);
        Ok(Self {
            root: id,
            resources,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn root_id(&self) -> &ObjectId {
        &self.root
    }

    pub fn root(&self) -> &StagedResource {
        // The root is inserted on construction and never removed.
        &self.resources[&self.root]
    }

    pub fn get(&self, id: &ObjectId) -> Option<&StagedResource> {
        self.resources.get(id)
    }

    pub fn resource(&self, id: &ObjectId) -> Result<&StagedResource, ModelError> {
        self.resources
            .get(id)
            .ok_or_else(|| ModelError::ResourceNotFound(id.clone()))
    }

    pub fn resource_mut(&mut self, id: &ObjectId) -> Result<&mut StagedResource, ModelError> {
        self.resources
            .get_mut(id)
            .ok_or_else(|| ModelError::ResourceNotFound(id.clone()))
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.resources.contains_key(id)
    }

    /// Number of resources, root included
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.len() <= 1
    }

    /// Children of `parent` in document order
    pub fn children(&self, parent: &StagedResource) -> Result<Vec<&StagedResource>, ModelError> {
        parent.children.iter().map(|id| self.resource(id)).collect()
    }

    /// Append `child` as the last child of `parent`
    pub fn add_child(&mut self, parent: &ObjectId, child: StagedResource) -> Result<(), ModelError> {
        if self.resources.contains_key(&child.id) {
            return Err(ModelError::Invalid(format!("duplicate resource id {}", child.id)));
        }
        if child.resource_type == ResourceType::Deposit {
            return Err(ModelError::Invalid(format!(
                "{} cannot be a deposit below the root",
                child.id
            )));
        }
        if !child.children.is_empty() {
            return Err(ModelError::Invalid(
                "children must be added with add_child".to_string(),
            ));
        }

        let parent_resource = self.resource_mut(parent)?;
        if !parent_resource.resource_type.can_have_children() {
            return Err(ModelError::Invalid(format!(
                "{} is a {} and cannot have children",
                parent, parent_resource.resource_type
            )));
        }
        if !parent_resource.resource_type.accepts_child(child.resource_type) {
            return Err(ModelError::Invalid(format!(
                "{} {} cannot contain {} {}",
                parent_resource.resource_type, parent, child.resource_type, child.id
            )));
        }
        parent_resource.children.push(child.id.clone());
        self.resources.insert(child.id.clone(), child);
        Ok(())
    }

    /// Ids of every resource below the root, depth-first pre-order
    pub fn pre_order_ids(&self) -> Vec<ObjectId> {
        pre_order(&self.root, &self.resources, false)
    }

    /// File resources in pre-order
    pub fn file_resources(&self) -> Vec<&StagedResource> {
        self.pre_order_ids()
            .iter()
            .filter_map(|id| self.resources.get(id))
            .filter(|r| r.is_file())
            .collect()
    }

    /// Id of the resource listing `id` as a child
    pub fn parent_of(&self, id: &ObjectId) -> Option<&ObjectId> {
        self.resources
            .values()
            .find(|r| r.children.contains(id))
            .map(|r| &r.id)
    }

    /// Check the structural invariants of the graph
    pub fn validate(&self) -> Result<(), ModelError> {
        let root = self
            .resources
            .get(&self.root)
            .ok_or_else(|| ModelError::Invalid(format!("root {} is missing", self.root)))?;
        if root.resource_type != ResourceType::Deposit {
            return Err(ModelError::Invalid(format!(
                "root {} must be a deposit, found {}",
                root.id, root.resource_type
            )));
        }

        let mut parents: HashMap<&ObjectId, &ObjectId> = HashMap::new();
        for resource in self.resources.values() {
            if resource.resource_type == ResourceType::Deposit && resource.id != self.root {
                return Err(ModelError::Invalid(format!(
                    "{} is a deposit but is not the root",
                    resource.id
                )));
            }
            if !resource.resource_type.can_have_children() && !resource.children.is_empty() {
                return Err(ModelError::Invalid(format!(
                    "file {} cannot have children",
                    resource.id
                )));
            }
            for child in &resource.children {
                let Some(child_resource) = self.resources.get(child) else {
                    return Err(ModelError::Invalid(format!(
                        "{} lists missing child {}",
                        resource.id, child
                    )));
                };
                if *child == self.root {
                    return Err(ModelError::Invalid(format!(
                        "{} lists the deposit root as a child",
                        resource.id
                    )));
                }
                let child_type = child_resource.resource_type;
                if !resource.resource_type.accepts_child(child_type) {
                    return Err(ModelError::Invalid(format!(
                        "{} {} cannot contain {} {}",
                        resource.resource_type, resource.id, child_type, child
                    )));
                }
                if let Some(previous) = parents.insert(child, &resource.id) {
                    return Err(ModelError::Invalid(format!(
                        "{} is a child of both {} and {}",
                        child, previous, resource.id
                    )));
                }
            }
            self.validate_primary_object(resource)?;
        }

        let reachable: HashSet<ObjectId> = self.pre_order_ids().into_iter().collect();
        if let Some(orphan) = self
            .resources
            .keys()
            .find(|id| **id != self.root && !reachable.contains(*id))
        {
            return Err(ModelError::Invalid(format!(
                "{} is not reachable from the deposit root",
                orphan
            )));
        }

        Ok(())
    }

    fn validate_primary_object(&self, resource: &StagedResource) -> Result<(), ModelError> {
        let Some(primary) = &resource.properties.primary_object else {
            return Ok(());
        };
        if resource.resource_type != ResourceType::Work {
            return Err(ModelError::Invalid(format!(
                "{} declares a primary object but is a {}",
                resource.id, resource.resource_type
            )));
        }
        let is_file_child = resource.children.contains(primary)
            && self.resources.get(primary).is_some_and(StagedResource::is_file);
        if !is_file_child {
            return Err(ModelError::Invalid(format!(
                "primary object {} of work {} is not one of its files",
                primary, resource.id
            )));
        }
        Ok(())
    }
}

fn pre_order(
    root: &ObjectId,
    resources: &BTreeMap<ObjectId, StagedResource>,
    include_root: bool,
) -> Vec<ObjectId> {
    let mut order = Vec::new();
    let mut visited: HashSet<&ObjectId> = HashSet::new();
    let mut stack: Vec<&ObjectId> = vec![root];

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Some(resource) = resources.get(id) else {
            continue;
        };
        if include_root || id != root {
            order.push(id.clone());
        }
        // Reverse so the first child is visited first.
        for child in resource.children.iter().rev() {
            stack.push(child);
        }
    }

    order
}
