//! State machine adapter
//!
//! The raft loop drives [`StoreStateMachine`]: committed commands are applied
//! to the registered local stores in log order, the originating caller is
//! woken up, and the cache policy is consulted for every applied batch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::cache::{CacheEvent, CacheNotifier, CachePolicy, Origin, Role};
use crate::command::{MutationBatch, StoreCommand, StoreType};
use crate::error::{Error, Result};
use crate::pending::PendingRequests;
use crate::pool::WorkerPool;
use crate::raft::StateMachine;
use crate::store::BackendStore;

pub type StoreRegistry = BTreeMap<StoreType, Arc<dyn BackendStore>>;

/// Flags shared between the state machine and the cluster context
#[derive(Debug, Default)]
pub struct RoleFlags {
    pub leader: AtomicBool,
    pub failed: AtomicBool,
}

pub struct StoreStateMachine {
    id: u64,
    stores: Arc<StoreRegistry>,
    pending: Arc<PendingRequests>,
    notifier: Arc<CacheNotifier>,
    backend_pool: Arc<WorkerPool>,
    snapshot_pool: Arc<WorkerPool>,
    flags: Arc<RoleFlags>,
    role: Role,
    last_applied: u64,
}

impl StoreStateMachine {
    pub fn new(
        id: u64,
        stores: Arc<StoreRegistry>,
        pending: Arc<PendingRequests>,
        notifier: Arc<CacheNotifier>,
        backend_pool: Arc<WorkerPool>,
        snapshot_pool: Arc<WorkerPool>,
        flags: Arc<RoleFlags>,
    ) -> Self {
        StoreStateMachine {
            id,
            stores,
            pending,
            notifier,
            backend_pool,
            snapshot_pool,
            flags,
            role: Role::Follower,
            last_applied: 0,
        }
    }

    /// Applies one command atomically to its store
    fn apply_command(&self, command: &StoreCommand) -> Result<MutationBatch> {
        let store = self.stores.get(&command.store).ok_or_else(|| {
            Error::Apply(format!("no local store registered for {}", command.store))
        })?;
        let batch = command.mutation()?;

        store
            .begin_tx()
            .map_err(|e| Error::Apply(format!("{:#}", e)))?;
        if let Err(e) = store.mutate(&batch).and_then(|_| store.commit_tx()) {
            if let Err(rollback) = store.rollback_tx() {
                log::error!("Failed to rollback store {}: {:#}", store.name(), rollback);
            }
            return Err(Error::Apply(format!("{:#}", e)));
        }
        Ok(batch)
    }

    /// Hands cache events to the backend pool
    fn dispatch(&self, events: Vec<CacheEvent>) {
        let notifier = self.notifier.clone();
        if let Err(e) = self.backend_pool.execute(move || {
            notifier.notify(events);
        }) {
            log::warn!("Failed to dispatch cache events: {}", e);
        }
    }
}

impl StateMachine for StoreStateMachine {
    fn on_apply(&mut self, index: u64, data: &[u8]) {
        if index <= self.last_applied {
            log::debug!(
                "Skip entry {} already applied up to {}",
                index,
                self.last_applied
            );
            return;
        }
        self.last_applied = index;

        let command = match StoreCommand::decode(data) {
            Ok(command) => command,
            Err(e) => {
                log::error!("Failed to decode raft entry {}: {}", index, e);
                self.pending.fail_entry(index, &e.to_string());
                return;
            }
        };

        let result = self.apply_command(&command).map(|batch| {
            let origin = Origin::of(self.role, command.forwarded, command.origin == self.id);
            let events = CachePolicy::events(self.role, origin, command.store, &batch);
            if !events.is_empty() {
                self.dispatch(events);
            }
            index
        });
        if let Err(e) = &result {
            log::error!(
                "Failed to apply entry {} to store {}: {}",
                index,
                command.store,
                e
            );
        }

        if command.origin == self.id {
            self.pending.resolve(&command.request_id, result);
        }
    }

    fn on_leader_start(&mut self, term: u64) {
        log::info!("Node {} starts leading at term {}", self.id, term);
        self.role = Role::Leader;
        self.flags.leader.store(true, Ordering::SeqCst);
        self.dispatch(CachePolicy::clear_all());
    }

    fn on_leader_stop(&mut self) {
        log::info!("Node {} stops leading", self.id);
        self.role = Role::Follower;
        self.flags.leader.store(false, Ordering::SeqCst);
        self.dispatch(CachePolicy::clear_all());
    }

    fn on_snapshot_save(&mut self) -> oneshot::Receiver<Result<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        let stores = self.stores.clone();
        let submitted = self.snapshot_pool.execute(move || {
            let _ = tx.send(save_stores(&stores));
        });
        if let Err(e) = submitted {
            log::warn!("Failed to schedule snapshot save: {}", e);
        }
        rx
    }

    fn on_snapshot_load(
        &mut self,
        index: u64,
        _term: u64,
        data: Vec<u8>,
    ) -> oneshot::Receiver<Result<()>> {
        self.last_applied = index;
        let (tx, rx) = oneshot::channel();
        let stores = self.stores.clone();
        let submitted = self.snapshot_pool.execute(move || {
            let _ = tx.send(load_stores(&stores, &data));
        });
        if let Err(e) = submitted {
            log::warn!("Failed to schedule snapshot load: {}", e);
        }
        rx
    }

    fn on_error(&mut self, error: &Error) {
        log::error!(
            "Node {} stops accepting writes after raft error: {}",
            self.id,
            error
        );
        self.flags.failed.store(true, Ordering::SeqCst);
        self.flags.leader.store(false, Ordering::SeqCst);
    }

    fn last_applied(&self) -> u64 {
        self.last_applied
    }
}

fn save_stores(stores: &StoreRegistry) -> Result<Vec<u8>> {
    let mut images = Vec::with_capacity(stores.len());
    for (store_type, store) in stores {
        let image = store.snapshot().map_err(|e| {
            Error::Apply(format!("failed to snapshot store {}: {:#}", store_type, e))
        })?;
        images.push((*store_type, image));
    }
    Ok(bincode::serialize(&images)?)
}

fn load_stores(stores: &StoreRegistry, data: &[u8]) -> Result<()> {
    let images: Vec<(StoreType, Vec<u8>)> = bincode::deserialize(data)?;
    for (store_type, image) in images {
        match stores.get(&store_type) {
            Some(store) => store.restore(&image).map_err(|e| {
                Error::Apply(format!("failed to restore store {}: {:#}", store_type, e))
            })?,
            None => log::warn!("Snapshot has data of unregistered store {}", store_type),
        }
    }
    Ok(())
}
