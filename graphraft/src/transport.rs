//! Transport between the nodes of a group
//!
//! Two kinds of traffic cross it: raft messages, which are fire and forget,
//! and forwarded store commands, which wait for the leader's answer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use raft::prelude::Message;

use crate::command::StoreType;
use crate::config::Peer;
use crate::context::ClusterContext;
use crate::error::{Error, Phase, Result};

#[tonic::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Delivers a raft message. Failures are dropped, raft retries.
    async fn send(&self, to: &Peer, msg: Message);

    /// Submits an encoded batch to `leader` and returns the index it was
    /// applied at
    async fn forward(&self, leader: &Peer, store: StoreType, batch: Vec<u8>) -> Result<u64>;

    /// Releases connections held by this transport
    async fn close(&self) {}
}

/// Nodes living in the same process, reachable through [`LocalTransport`]
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<u64, Weak<ClusterContext>>>,
    isolated: RwLock<HashSet<u64>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalNetwork::default())
    }

    /// Registers the node `id` and returns the transport it sends through
    pub fn join(self: &Arc<Self>, id: u64, context: &Arc<ClusterContext>) -> Arc<LocalTransport> {
        self.nodes
            .write()
            .unwrap()
            .insert(id, Arc::downgrade(context));
        Arc::new(LocalTransport {
            id,
            network: self.clone(),
        })
    }

    /// Cuts every link of node `id`
    pub fn isolate(&self, id: u64) {
        self.isolated.write().unwrap().insert(id);
    }

    pub fn heal(&self, id: u64) {
        self.isolated.write().unwrap().remove(&id);
    }

    fn route(&self, from: u64, to: u64) -> Option<Arc<ClusterContext>> {
        {
            let isolated = self.isolated.read().unwrap();
            if isolated.contains(&from) || isolated.contains(&to) {
                return None;
            }
        }
        self.nodes.read().unwrap().get(&to).and_then(Weak::upgrade)
    }
}

pub struct LocalTransport {
    id: u64,
    network: Arc<LocalNetwork>,
}

#[tonic::async_trait]
impl Transport for LocalTransport {
    async fn send(&self, to: &Peer, msg: Message) {
        if let Some(context) = self.network.route(self.id, to.id) {
            if let Err(e) = context.step(msg) {
                log::debug!("Node {} can't take raft message: {}", to.id, e);
            }
        }
    }

    async fn forward(&self, leader: &Peer, store: StoreType, batch: Vec<u8>) -> Result<u64> {
        match self.network.route(self.id, leader.id) {
            Some(context) => context.submit_forwarded(store, batch).await,
            None => Err(Error::Timeout(Phase::Forward)),
        }
    }
}
