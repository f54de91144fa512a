//! Store commands
//!
//! A write travels as a [`StoreCommand`]: the target store, the node that put it
//! on the log, whether it arrived through forwarding, a correlation id and the
//! mutation batch. The batch is encoded once by the node that accepted the
//! write and carried as opaque bytes from there on, so forwarding a write and
//! proposing it locally produce the same log entry apart from the forwarded flag.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::pb;

/// Selects the local store a command targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StoreType {
    Schema,
    Graph,
    System,
}

impl StoreType {
    pub const ALL: [StoreType; 3] = [StoreType::Schema, StoreType::Graph, StoreType::System];
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreType::Schema => "schema",
            StoreType::Graph => "graph",
            StoreType::System => "system",
        };
        f.write_str(name)
    }
}

impl From<StoreType> for pb::StoreKind {
    fn from(store: StoreType) -> Self {
        match store {
            StoreType::Schema => pb::StoreKind::Schema,
            StoreType::Graph => pb::StoreKind::Graph,
            StoreType::System => pb::StoreKind::System,
        }
    }
}

impl From<pb::StoreKind> for StoreType {
    fn from(kind: pb::StoreKind) -> Self {
        match kind {
            pb::StoreKind::Schema => StoreType::Schema,
            pb::StoreKind::Graph => StoreType::Graph,
            pb::StoreKind::System => StoreType::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Insert,
    Append,
    Eliminate,
    Delete,
}

/// Logical kind of the entity an action affects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    PropertyKey,
    VertexLabel,
    EdgeLabel,
    IndexLabel,
    Vertex,
    Edge,
    SecondaryIndex,
    RangeIndex,
    SearchIndex,
    Counter,
    Task,
}

impl EntityType {
    pub fn is_schema(&self) -> bool {
        matches!(
            self,
            EntityType::PropertyKey
                | EntityType::VertexLabel
                | EntityType::EdgeLabel
                | EntityType::IndexLabel
        )
    }

    pub fn is_graph(&self) -> bool {
        matches!(self, EntityType::Vertex | EntityType::Edge)
    }
}

/// One serialized row change produced by the graph engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAction {
    pub action: Action,
    pub entity: EntityType,
    pub id: String,
    pub payload: Vec<u8>,
}

impl BackendAction {
    pub fn new(action: Action, entity: EntityType, id: impl Into<String>, payload: Vec<u8>) -> Self {
        BackendAction {
            action,
            entity,
            id: id.into(),
            payload,
        }
    }
}

/// Ordered actions committed as one log entry and applied as one unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationBatch {
    actions: Vec<BackendAction>,
}

impl MutationBatch {
    pub fn new() -> Self {
        MutationBatch::default()
    }

    pub fn push(&mut self, action: BackendAction) -> &mut Self {
        self.actions.push(action);
        self
    }

    pub fn insert(&mut self, entity: EntityType, id: impl Into<String>, payload: Vec<u8>) -> &mut Self {
        self.push(BackendAction::new(Action::Insert, entity, id, payload))
    }

    pub fn append(&mut self, entity: EntityType, id: impl Into<String>, payload: Vec<u8>) -> &mut Self {
        self.push(BackendAction::new(Action::Append, entity, id, payload))
    }

    pub fn eliminate(&mut self, entity: EntityType, id: impl Into<String>) -> &mut Self {
        self.push(BackendAction::new(Action::Eliminate, entity, id, Vec::new()))
    }

    pub fn delete(&mut self, entity: EntityType, id: impl Into<String>) -> &mut Self {
        self.push(BackendAction::new(Action::Delete, entity, id, Vec::new()))
    }

    pub fn actions(&self) -> &[BackendAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Affected ids grouped by entity kind, in first-seen order per kind
    pub fn ids_by_entity(&self) -> BTreeMap<EntityType, Vec<String>> {
        let mut ids: BTreeMap<EntityType, Vec<String>> = BTreeMap::new();
        for action in &self.actions {
            let entry = ids.entry(action.entity).or_default();
            if !entry.contains(&action.id) {
                entry.push(action.id.clone());
            }
        }
        ids
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// The payload of one normal raft log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCommand {
    pub request_id: Uuid,
    pub origin: u64,
    pub forwarded: bool,
    pub store: StoreType,
    /// Encoded [`MutationBatch`]
    pub batch: Vec<u8>,
}

impl StoreCommand {
    pub fn new(origin: u64, forwarded: bool, store: StoreType, batch: Vec<u8>) -> Self {
        StoreCommand {
            request_id: Uuid::new_v4(),
            origin,
            forwarded,
            store,
            batch,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn mutation(&self) -> Result<MutationBatch> {
        MutationBatch::decode(&self.batch)
    }
}
