//! In-memory backend store
//!
//! Mutations are staged in a transaction buffer and only become visible to
//! readers on commit, so a batch is never observed half applied.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use anyhow::{anyhow, bail};

use crate::command::{Action, EntityType, MutationBatch};
use crate::store::BackendStore;

type Key = (EntityType, String);

#[derive(Debug, Default)]
pub struct MemoryStore {
    name: String,
    rows: RwLock<BTreeMap<Key, Vec<u8>>>,
    /// Staged changes, `None` marks a removal
    tx: Mutex<Option<BTreeMap<Key, Option<Vec<u8>>>>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryStore {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rows ordered by key
    pub fn rows(&self) -> Vec<(EntityType, String, Vec<u8>)> {
        self.rows
            .read()
            .unwrap()
            .iter()
            .map(|((entity, id), value)| (*entity, id.clone(), value.clone()))
            .collect()
    }
}

impl BackendStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin_tx(&self) -> anyhow::Result<()> {
        let mut tx = self.tx.lock().unwrap();
        if tx.is_some() {
            bail!("store {} already has an open transaction", self.name);
        }
        *tx = Some(BTreeMap::new());
        Ok(())
    }

    fn mutate(&self, batch: &MutationBatch) -> anyhow::Result<()> {
        let mut tx = self.tx.lock().unwrap();
        let staged = tx
            .as_mut()
            .ok_or_else(|| anyhow!("store {} has no open transaction", self.name))?;
        let rows = self.rows.read().unwrap();

        for action in batch.actions() {
            let key = (action.entity, action.id.clone());
            match action.action {
                Action::Insert => {
                    staged.insert(key, Some(action.payload.clone()));
                }
                Action::Append => {
                    let current = match staged.get(&key) {
                        Some(value) => value.clone(),
                        None => rows.get(&key).cloned(),
                    };
                    let mut value = current.unwrap_or_default();
                    value.extend_from_slice(&action.payload);
                    staged.insert(key, Some(value));
                }
                Action::Eliminate | Action::Delete => {
                    staged.insert(key, None);
                }
            }
        }
        Ok(())
    }

    fn commit_tx(&self) -> anyhow::Result<()> {
        let staged = self
            .tx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("store {} has no open transaction", self.name))?;
        let mut rows = self.rows.write().unwrap();
        for (key, value) in staged {
            match value {
                Some(value) => {
                    rows.insert(key, value);
                }
                None => {
                    rows.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn rollback_tx(&self) -> anyhow::Result<()> {
        self.tx.lock().unwrap().take();
        Ok(())
    }

    fn get(&self, entity: EntityType, id: &str) -> Option<Vec<u8>> {
        self.rows
            .read()
            .unwrap()
            .get(&(entity, id.to_string()))
            .cloned()
    }

    fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        let rows = self.rows.read().unwrap();
        Ok(bincode::serialize(&*rows)?)
    }

    fn restore(&self, data: &[u8]) -> anyhow::Result<()> {
        let rows: BTreeMap<Key, Vec<u8>> = bincode::deserialize(data)?;
        *self.rows.write().unwrap() = rows;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(store: &MemoryStore, batch: &MutationBatch) {
        store.begin_tx().unwrap();
        store.mutate(batch).unwrap();
        store.commit_tx().unwrap();
    }

    #[test]
    fn test_staged_until_commit() {
        let store = MemoryStore::new("graph");
        let mut batch = MutationBatch::new();
        batch.insert(EntityType::Vertex, "v1", b"a".to_vec());

        store.begin_tx().unwrap();
        store.mutate(&batch).unwrap();
        assert!(store.get(EntityType::Vertex, "v1").is_none());
        store.commit_tx().unwrap();
        assert_eq!(store.get(EntityType::Vertex, "v1").unwrap(), b"a");
    }

    #[test]
    fn test_rollback_discards() {
        let store = MemoryStore::new("graph");
        let mut batch = MutationBatch::new();
        batch.insert(EntityType::Vertex, "v1", b"a".to_vec());

        store.begin_tx().unwrap();
        store.mutate(&batch).unwrap();
        store.rollback_tx().unwrap();
        assert!(store.is_empty());
        assert!(store.commit_tx().is_err());
    }

    #[test]
    fn test_actions() {
        let store = MemoryStore::new("graph");
        let mut batch = MutationBatch::new();
        batch
            .insert(EntityType::Vertex, "v1", b"a".to_vec())
            .append(EntityType::Vertex, "v1", b"b".to_vec())
            .append(EntityType::Edge, "e1", b"x".to_vec())
            .insert(EntityType::Vertex, "v2", b"c".to_vec())
            .eliminate(EntityType::Vertex, "v2");
        apply(&store, &batch);

        assert_eq!(store.get(EntityType::Vertex, "v1").unwrap(), b"ab");
        assert_eq!(store.get(EntityType::Edge, "e1").unwrap(), b"x");
        assert!(store.get(EntityType::Vertex, "v2").is_none());

        let mut batch = MutationBatch::new();
        batch.delete(EntityType::Vertex, "v1");
        apply(&store, &batch);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_snapshot_restore() {
        let store = MemoryStore::new("schema");
        let mut batch = MutationBatch::new();
        batch.insert(EntityType::VertexLabel, "person", b"{}".to_vec());
        apply(&store, &batch);
        let data = store.snapshot().unwrap();

        let other = MemoryStore::new("schema");
        other.restore(&data).unwrap();
        assert_eq!(other.rows(), store.rows());
        assert!(other.restore(b"not a snapshot").is_err());
    }
}
