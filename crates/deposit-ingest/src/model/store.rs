//! Transactional store of deposit graphs
//!
//! Readers get an immutable snapshot. Writers work on a private copy inside a
//! [`ModelTransaction`]; `commit` publishes the copy, `abort` (or dropping the
//! transaction) discards it. One job writes a deposit's model at a time, so the
//! last commit wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use deposit_common::DepositId;
use tracing::{debug, warn};

use super::DepositGraph;
use crate::config::MODEL_FILE_NAME;
use crate::error::ModelError;

/// Holds the deposit graph of every deposit known to this process
#[derive(Debug, Default)]
pub struct DepositModelStore {
    graphs: RwLock<HashMap<DepositId, Arc<DepositGraph>>>,
    persist_dir: Option<PathBuf>,
}

impl DepositModelStore {
    /// Store keeping graphs in memory only
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Store backed by `<dir>/<deposit id>/model.json`
    pub fn persistent(dir: impl AsRef<Path>) -> Self {
        Self {
            graphs: RwLock::default(),
            persist_dir: Some(dir.as_ref().to_path_buf()),
        }
    }

    /// Register the graph of a deposit, replacing any previous one
    pub fn insert(&self, deposit_id: &DepositId, graph: DepositGraph) -> Result<(), ModelError> {
        graph.validate()?;
        self.publish(deposit_id, graph)
    }

    /// Immutable snapshot of a deposit's graph
    pub fn read(&self, deposit_id: &DepositId) -> Result<Arc<DepositGraph>, ModelError> {
        if let Some(graph) = self.cached(deposit_id) {
            return Ok(graph);
        }
        self.load(deposit_id)
    }

    /// Open a write transaction on a deposit's graph
    pub fn begin_write(&self, deposit_id: &DepositId) -> Result<ModelTransaction<'_>, ModelError> {
        let snapshot = self.read(deposit_id)?;
        debug!(deposit_id = %deposit_id, "Started model transaction");
        Ok(ModelTransaction {
            store: self,
            deposit_id: deposit_id.clone(),
            graph: DepositGraph::clone(&snapshot),
            dirty: false,
            finished: false,
        })
    }

    /// Load a deposit's graph from disk into the cache
    pub fn load(&self, deposit_id: &DepositId) -> Result<Arc<DepositGraph>, ModelError> {
        let Some(path) = self.model_path(deposit_id) else {
            return Err(ModelError::DepositNotFound(deposit_id.clone()));
        };
        if !path.exists() {
            return Err(ModelError::DepositNotFound(deposit_id.clone()));
        }

        let json = std::fs::read_to_string(&path)?;
        let graph = Arc::new(DepositGraph::from_json(&json)?);
        self.graphs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(deposit_id.clone(), graph.clone());

        debug!(deposit_id = %deposit_id, path = %path.display(), "Loaded deposit model");
        Ok(graph)
    }

    /// Drop the cached graph, and its file when persistent
    pub fn remove(&self, deposit_id: &DepositId) -> Result<(), ModelError> {
        self.graphs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(deposit_id);
        if let Some(path) = self.model_path(deposit_id) {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn cached(&self, deposit_id: &DepositId) -> Option<Arc<DepositGraph>> {
        self.graphs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(deposit_id)
            .cloned()
    }

    fn model_path(&self, deposit_id: &DepositId) -> Option<PathBuf> {
        self.persist_dir
            .as_ref()
            .map(|dir| dir.join(deposit_id.as_str()).join(MODEL_FILE_NAME))
    }

    fn publish(&self, deposit_id: &DepositId, graph: DepositGraph) -> Result<(), ModelError> {
        if let Some(path) = self.model_path(deposit_id) {
            write_atomically(&path, graph.to_json()?.as_bytes())?;
        }
        self.graphs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(deposit_id.clone(), Arc::new(graph));
        Ok(())
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), ModelError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Write view over one deposit's graph
pub struct ModelTransaction<'a> {
    store: &'a DepositModelStore,
    deposit_id: DepositId,
    graph: DepositGraph,
    dirty: bool,
    finished: bool,
}

impl<'a> ModelTransaction<'a> {
    pub fn deposit_id(&self) -> &DepositId {
        &self.deposit_id
    }

    pub fn graph(&self) -> &DepositGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut DepositGraph {
        self.dirty = true;
        &mut self.graph
    }

    /// Publish the changes made in this transaction
    pub fn commit(mut self) -> Result<(), ModelError> {
        self.finished = true;
        if !self.dirty {
            debug!(deposit_id = %self.deposit_id, "Committed unchanged model transaction");
            return Ok(());
        }

        self.graph.validate()?;
        self.store.publish(&self.deposit_id, self.graph.clone())?;
        debug!(deposit_id = %self.deposit_id, "Committed model transaction");
        Ok(())
    }

    /// Discard the changes made in this transaction
    pub fn abort(mut self) {
        self.finished = true;
        debug!(deposit_id = %self.deposit_id, dirty = self.dirty, "Aborted model transaction");
    }
}

impl Drop for ModelTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished && self.dirty {
            warn!(
                deposit_id = %self.deposit_id,
                "Model transaction dropped without commit, changes discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StagedResource;
    use deposit_common::ObjectId;

    fn id(s: &str) -> ObjectId {
        s.parse().unwrap()
    }

    fn graph() -> DepositGraph {
        let mut graph = DepositGraph::new(StagedResource::deposit(id("d1"))).unwrap();
        graph.add_child(&id("d1"), StagedResource::folder(id("A"))).unwrap();
        graph
    }

    #[test]
    fn test_commit_publishes_changes() {
        let store = DepositModelStore::in_memory();
        let deposit: DepositId = "d1".parse().unwrap();
        store.insert(&deposit, graph()).unwrap();

        let mut tx = store.begin_write(&deposit).unwrap();
        tx.graph_mut()
            .add_child(&id("A"), StagedResource::file(id("f1")))
            .unwrap();
        tx.commit().unwrap();

        assert!(store.read(&deposit).unwrap().contains(&id("f1")));
    }

    #[test]
    fn test_abort_discards_changes() {
        let store = DepositModelStore::in_memory();
        let deposit: DepositId = "d1".parse().unwrap();
        store.insert(&deposit, graph()).unwrap();

        let mut tx = store.begin_write(&deposit).unwrap();
        tx.graph_mut()
            .add_child(&id("A"), StagedResource::file(id("f1")))
            .unwrap();
        tx.abort();

        assert!(!store.read(&deposit).unwrap().contains(&id("f1")));
    }

    #[test]
    fn test_drop_discards_changes() {
        let store = DepositModelStore::in_memory();
        let deposit: DepositId = "d1".parse().unwrap();
        store.insert(&deposit, graph()).unwrap();

        {
            let mut tx = store.begin_write(&deposit).unwrap();
            tx.graph_mut()
                .add_child(&id("A"), StagedResource::file(id("f1")))
                .unwrap();
        }

        assert!(!store.read(&deposit).unwrap().contains(&id("f1")));
    }

    #[test]
    fn test_unknown_deposit() {
        let store = DepositModelStore::in_memory();
        let deposit: DepositId = "missing".parse().unwrap();
        assert!(matches!(store.read(&deposit), Err(ModelError::DepositNotFound(_))));
    }

    #[test]
    fn test_persistent_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let deposit: DepositId = "d1".parse().unwrap();

        {
            let store = DepositModelStore::persistent(dir.path());
            store.insert(&deposit, graph()).unwrap();
            let mut tx = store.begin_write(&deposit).unwrap();
            tx.graph_mut()
                .add_child(&id("A"), StagedResource::file(id("f1")))
                .unwrap();
            tx.commit().unwrap();
        }

        let reopened = DepositModelStore::persistent(dir.path());
        let graph = reopened.read(&deposit).unwrap();
        assert!(graph.contains(&id("f1")));
        assert!(dir.path().join("d1").join(MODEL_FILE_NAME).exists());
    }
}
