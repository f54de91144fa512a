//! Local, non-replicated stores
//!
//! The replication layer sees a local store as an opaque transactional
//! mutation sink plus a read path and a snapshot primitive. Engines plug in by
//! implementing [`BackendStore`].

pub mod memory;

pub use memory::MemoryStore;

use crate::command::{EntityType, MutationBatch};

pub trait BackendStore: Send + Sync {
    fn name(&self) -> &str;

    /// Starts staging a batch. Only the state machine calls the mutation
    /// methods, one batch at a time.
    fn begin_tx(&self) -> anyhow::Result<()>;
    fn mutate(&self, batch: &MutationBatch) -> anyhow::Result<()>;
    fn commit_tx(&self) -> anyhow::Result<()>;
    fn rollback_tx(&self) -> anyhow::Result<()>;

    fn get(&self, entity: EntityType, id: &str) -> Option<Vec<u8>>;

    /// Serializes the whole store content
    fn snapshot(&self) -> anyhow::Result<Vec<u8>>;
    /// Replaces the store content with a snapshot produced by `snapshot`
    fn restore(&self, data: &[u8]) -> anyhow::Result<()>;
}
