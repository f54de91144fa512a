//! Cache invalidation policy
//!
//! After a batch is applied a node decides, from its role and from where the
//! write came from, whether its own read cache may now be stale. The decision
//! is published on a bounded, best-effort channel to the graph engine.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use raft::StateRole;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

use crate::command::{EntityType, MutationBatch, StoreType};
use crate::metrics;

const LOG_WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Replication role of a node as seen by the cache policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Candidate,
    Follower,
}

impl From<StateRole> for Role {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Leader => Role::Leader,
            StateRole::Candidate | StateRole::PreCandidate => Role::Candidate,
            StateRole::Follower => Role::Follower,
        }
    }
}

/// How a write reached the node applying it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted by this node straight from a client
    Client,
    /// Received from a follower that forwarded it
    Forwarded,
    /// Replicated through the log
    Log,
}

impl Origin {
    /// `proposed_here` tells whether the applying node put the entry in the
    /// log. Entries of an earlier leader reach a new leader through the log.
    pub fn of(role: Role, forwarded: bool, proposed_here: bool) -> Origin {
        match (role, forwarded, proposed_here) {
            (Role::Leader, true, _) => Origin::Forwarded,
            (Role::Leader, false, true) => Origin::Client,
            _ => Origin::Log,
        }
    }
}

pub struct CachePolicy;

impl CachePolicy {
    /// Whether the local cache must be invalidated. A leader that took the
    /// write from its own client already updated its cache on the way in.
    pub fn decide(role: Role, origin: Origin) -> bool {
        !(role == Role::Leader && origin == Origin::Client)
    }

    /// Events for one applied batch, empty when nothing has to be invalidated
    pub fn events(
        role: Role,
        origin: Origin,
        store: StoreType,
        batch: &MutationBatch,
    ) -> Vec<CacheEvent> {
        if store == StoreType::System || !Self::decide(role, origin) {
            return Vec::new();
        }
        batch
            .ids_by_entity()
            .into_iter()
            .filter(|(entity, _)| entity.is_schema() || entity.is_graph())
            .map(|(entity, ids)| CacheEvent {
                store,
                entity,
                action: CacheAction::Invalidate(ids),
            })
            .collect()
    }

    /// Clear-all events published when the node's role changes. Schema and
    /// graph caches are represented by a vertex label and a vertex.
    pub fn clear_all() -> Vec<CacheEvent> {
        vec![
            CacheEvent {
                store: StoreType::Schema,
                entity: EntityType::VertexLabel,
                action: CacheAction::Clear,
            },
            CacheEvent {
                store: StoreType::Graph,
                entity: EntityType::Vertex,
                action: CacheAction::Clear,
            },
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheAction {
    Invalidate(Vec<String>),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub store: StoreType,
    pub entity: EntityType,
    pub action: CacheAction,
}

/// Publishing side of the cache event channel
pub struct CacheNotifier {
    sender: Sender<CacheEvent>,
    last_warn: Mutex<Option<Instant>>,
}

impl CacheNotifier {
    pub fn new(capacity: usize) -> (Self, Receiver<CacheEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let notifier = CacheNotifier {
            sender,
            last_warn: Mutex::new(None),
        };
        (notifier, receiver)
    }

    /// Publishes events without waiting. Returns how many were dropped.
    pub fn notify(&self, events: Vec<CacheEvent>) -> usize {
        let mut dropped = 0;
        for event in events {
            match self.sender.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    dropped += 1;
                    metrics::CACHE_DROPPED_COUNTER
                        .with_label_values(&[&event.store.to_string()])
                        .inc();
                    self.warn_busy();
                }
                // nobody listens for cache events
                Err(TrySendError::Closed(_)) => {}
            }
        }
        dropped
    }

    fn warn_busy(&self) {
        let mut last_warn = self.last_warn.lock().unwrap();
        if last_warn.map_or(true, |t| t.elapsed() >= LOG_WARN_INTERVAL) {
            log::warn!("Can't update cache due to the cache event channel is too busy");
            *last_warn = Some(Instant::now());
        }
    }
}
