//! Cluster context
//!
//! One [`ClusterContext`] exists per consensus group (one group per graph).
//! It owns the group membership, the worker pools, the timeouts and the
//! registry of local stores, and it is the only place that answers "am I the
//! leader" and "what is my endpoint".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use once_cell::sync::OnceCell;
use raft::prelude::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::cache::{CacheEvent, CacheNotifier, Role};
use crate::command::{MutationBatch, StoreCommand, StoreType};
use crate::config::{GroupConfiguration, Peer, RaftConfig};
use crate::error::{Error, Phase, Result};
use crate::forwarder::LeaderForwarder;
use crate::pending::PendingRequests;
use crate::pool::{RejectPolicy, WorkerPool};
use crate::raft::proposal;
use crate::raft::{FileStorage, Node, NodeHandle, NodeStatus, RaftPaths};
use crate::raft_store::ReplicatedStore;
use crate::state_machine::{RoleFlags, StoreRegistry, StoreStateMachine};
use crate::store::BackendStore;
use crate::transport::Transport;

/// A member of the group and the role it is known to have
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub peer: Peer,
    pub role: Role,
}

/// Everything that exists only once the node is started
struct NodeRuntime {
    endpoint: Peer,
    node: NodeHandle,
    transport: Arc<dyn Transport>,
    forwarder: LeaderForwarder,
    read_index_pool: Arc<WorkerPool>,
    snapshot_pool: Arc<WorkerPool>,
    backend_pool: Arc<WorkerPool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct ClusterContext {
    group: String,
    config: RaftConfig,
    peers: Arc<RwLock<GroupConfiguration>>,
    stores: RwLock<StoreRegistry>,
    started: AtomicBool,
    stopped: AtomicBool,
    pending: Arc<PendingRequests>,
    notifier: Arc<CacheNotifier>,
    cache_events: Mutex<Option<mpsc::Receiver<CacheEvent>>>,
    flags: Arc<RoleFlags>,
    runtime: OnceCell<NodeRuntime>,
    // serializes membership changes and leader transfers
    membership: tokio::sync::Mutex<()>,
}

impl ClusterContext {
    /// Validates `config` and parses its group peer list
    pub fn new(group: &str, config: RaftConfig) -> Result<Arc<Self>> {
        if group.trim().is_empty() {
            return Err(Error::Configuration("group name must not be empty".into()));
        }
        config.validate()?;
        let peers = GroupConfiguration::parse(&config.group_peers)?;
        let (notifier, cache_events) = CacheNotifier::new(config.cache_event_queue_size);

        Ok(Arc::new(ClusterContext {
            group: group.to_string(),
            config,
            peers: Arc::new(RwLock::new(peers)),
            stores: RwLock::new(StoreRegistry::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            pending: Arc::new(PendingRequests::new()),
            notifier: Arc::new(notifier),
            cache_events: Mutex::new(Some(cache_events)),
            flags: Arc::new(RoleFlags::default()),
            runtime: OnceCell::new(),
            membership: tokio::sync::Mutex::new(()),
        }))
    }

    /// Binds `store_type` to its local store.
    ///
    /// # Panics
    ///
    /// When the store type is already registered or the node is started.
    pub fn register(
        self: &Arc<Self>,
        store_type: StoreType,
        store: Arc<dyn BackendStore>,
    ) -> Arc<ReplicatedStore> {
        assert!(
            !self.started.load(Ordering::SeqCst),
            "store {} registered after raft group {} started",
            store_type,
            self.group
        );
        let mut stores = self.stores.write().unwrap();
        assert!(
            !stores.contains_key(&store_type),
            "store {} is already registered in raft group {}",
            store_type,
            self.group
        );
        stores.insert(store_type, store.clone());
        Arc::new(ReplicatedStore::new(store_type, store, self.clone()))
    }

    /// Prepares storage, builds the worker pools and starts the raft node
    /// with the configured peers as initial membership.
    pub async fn start(&self, endpoint: &str, transport: Arc<dyn Transport>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Startup(format!(
                "raft group {} is already started",
                self.group
            )));
        }
        let initial = self.peers.read().unwrap().clone();
        let me = initial.find_by_addr(endpoint).ok_or_else(|| {
            Error::Startup(format!(
                "endpoint {} is not a peer of raft group {}",
                endpoint, self.group
            ))
        })?;

        let conf = &self.config;
        let paths = RaftPaths::new(&conf.path, &self.group);
        paths.prepare().map_err(|e| {
            Error::Startup(format!(
                "failed to prepare raft directories of group {} under {}: {}",
                self.group, conf.path, e
            ))
        })?;
        let storage = FileStorage::open(paths, &initial)
            .map_err(|e| Error::Startup(format!("failed to load raft storage: {}", e)))?;

        let keep_alive = conf.pool_keep_alive();
        let read_index_pool = Arc::new(WorkerPool::new(
            "raft-read-index",
            conf.read_index_threads,
            conf.read_index_threads << 2,
            conf.pool_queue_size,
            keep_alive,
            RejectPolicy::Abort,
        )?);
        let snapshot_pool = Arc::new(WorkerPool::new(
            "raft-snapshot",
            conf.snapshot_threads,
            conf.snapshot_threads << 2,
            conf.pool_queue_size,
            keep_alive,
            RejectPolicy::CallerRuns,
        )?);
        let backend_pool = Arc::new(WorkerPool::new(
            "raft-backend",
            conf.backend_threads,
            conf.backend_threads,
            conf.pool_queue_size,
            keep_alive,
            RejectPolicy::CallerRuns,
        )?);

        let stores = Arc::new(self.stores.read().unwrap().clone());
        let state_machine = StoreStateMachine::new(
            me.id,
            stores,
            self.pending.clone(),
            self.notifier.clone(),
            backend_pool.clone(),
            snapshot_pool.clone(),
            self.flags.clone(),
        );
        let (node, out_mailbox, node_task) =
            Node::start(me.id, conf, storage, state_machine, self.peers.clone()).await?;
        let dispatcher = tokio::spawn(dispatch_messages(
            out_mailbox,
            transport.clone(),
            self.peers.clone(),
        ));

        let runtime = NodeRuntime {
            endpoint: me.clone(),
            node,
            forwarder: LeaderForwarder::new(transport.clone(), conf.rpc_timeout()),
            transport,
            read_index_pool,
            snapshot_pool,
            backend_pool,
            tasks: Mutex::new(vec![node_task, dispatcher]),
        };
        if self.runtime.set(runtime).is_err() {
            return Err(Error::Startup(format!(
                "raft group {} is already started",
                self.group
            )));
        }
        log::info!(
            "Raft node {} of group {} started at {}",
            me.id,
            self.group,
            me.addr
        );
        Ok(())
    }

    /// Waits until a leader is known, then until the local log caught up
    /// with the leader's commit index.
    pub async fn await_ready(
        &self,
        election_timeout: Duration,
        log_sync_timeout: Duration,
    ) -> Result<()> {
        self.check_running()?;
        let leader = self.wait_for_leader(election_timeout).await?;
        log::info!("Raft group {} has leader {}", self.group, leader);

        let node = &self.runtime()?.node;
        let deadline = Instant::now() + log_sync_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(Phase::LogSync));
            }
            let attempt = remaining.min(self.config.election_timeout());
            match time::timeout(attempt, node.read_index()).await {
                Ok(Ok(index)) => {
                    log::info!(
                        "Raft node {} of group {} caught up to index {}",
                        node.id(),
                        self.group,
                        index
                    );
                    return Ok(());
                }
                // leadership may have moved, ask again
                Ok(Err(Error::Busy)) | Err(_) => continue,
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Stops the raft node, drains the worker pools and releases the
    /// transport. Calling it again does nothing.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let runtime = match self.runtime.get() {
            Some(runtime) => runtime,
            None => return,
        };
        log::info!(
            "Stopping raft node {} of group {}",
            runtime.endpoint.id,
            self.group
        );

        runtime.node.stop();
        let tasks: Vec<JoinHandle<()>> = runtime.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Raft task of group {} failed: {}", self.group, e);
            }
        }
        self.flags.leader.store(false, Ordering::SeqCst);
        self.pending.close();
        runtime.transport.close().await;

        let pools = vec![
            runtime.read_index_pool.clone(),
            runtime.snapshot_pool.clone(),
            runtime.backend_pool.clone(),
        ];
        let drained = tokio::task::spawn_blocking(move || {
            for pool in pools {
                pool.shutdown();
            }
        })
        .await;
        if let Err(e) = drained {
            log::error!("Failed to drain worker pools of group {}: {}", self.group, e);
        }
        log::info!(
            "Raft node {} of group {} stopped",
            runtime.endpoint.id,
            self.group
        );
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.flags.leader.load(Ordering::SeqCst)
            && !self.flags.failed.load(Ordering::SeqCst)
            && !self.stopped.load(Ordering::SeqCst)
    }

    /// The leader this node currently knows of
    pub fn leader(&self) -> Option<Peer> {
        let leader_id = self.runtime.get()?.node.status().leader_id;
        self.peers.read().unwrap().peer(leader_id)
    }

    pub fn endpoint(&self) -> Option<Peer> {
        self.runtime.get().map(|runtime| runtime.endpoint.clone())
    }

    pub fn status(&self) -> Option<NodeStatus> {
        self.runtime.get().map(|runtime| runtime.node.status())
    }

    pub fn list_peers(&self) -> Vec<PeerState> {
        let status = self.status().unwrap_or_default();
        self.peers
            .read()
            .unwrap()
            .peers()
            .into_iter()
            .map(|peer| {
                let role = if peer.id == status.leader_id {
                    Role::Leader
                } else if peer.id == status.id {
                    Role::from(status.role)
                } else {
                    Role::Follower
                };
                PeerState { peer, role }
            })
            .collect()
    }

    /// Asks the leader to hand leadership to the peer at `endpoint` and waits
    /// until it took over
    pub async fn transfer_leadership(&self, endpoint: &str) -> Result<()> {
        let _membership = self.membership.lock().await;
        self.check_running()?;
        let target = self.find_peer(endpoint)?;
        let node = &self.runtime()?.node;
        if node.status().leader_id == target.id {
            return Ok(());
        }

        node.transfer_leader(target.id).await?;
        let mut status = node.subscribe();
        let took_over = async {
            loop {
                if status.borrow().leader_id == target.id {
                    return Ok::<_, Error>(());
                }
                status.changed().await.map_err(|_| Error::Stopped)?;
            }
        };
        time::timeout(self.config.election_timeout() * 2, took_over)
            .await
            .map_err(|_| Error::Timeout(Phase::Election))??;
        log::info!("Raft group {} transferred leadership to {}", self.group, target);
        Ok(())
    }

    pub async fn add_peer(&self, peer: Peer) -> Result<()> {
        let _membership = self.membership.lock().await;
        self.check_running()?;
        let known = {
            let peers = self.peers.read().unwrap();
            peers.contains(peer.id) || peers.find_by_addr(&peer.addr).is_some()
        };
        if known {
            return Err(Error::Configuration(format!(
                "peer {} is already a member of raft group {}",
                peer, self.group
            )));
        }

        let cc = proposal::add_node(peer.id, &peer.addr);
        self.change_membership(&cc).await?;
        log::info!("Raft group {} added peer {}", self.group, peer);
        Ok(())
    }

    pub async fn remove_peer(&self, id: u64) -> Result<()> {
        let _membership = self.membership.lock().await;
        self.check_running()?;
        let peer = self.peers.read().unwrap().peer(id);
        let peer = peer.ok_or_else(|| {
            Error::Configuration(format!("peer {} is not a member of raft group {}", id, self.group))
        })?;

        let cc = proposal::remove_node(id);
        self.change_membership(&cc).await?;
        log::info!("Raft group {} removed peer {}", self.group, peer);
        Ok(())
    }

    async fn change_membership(&self, cc: &raft::prelude::ConfChange) -> Result<()> {
        let node = &self.runtime()?.node;
        time::timeout(self.config.rpc_timeout(), node.propose_conf_change(cc))
            .await
            .map_err(|_| Error::Timeout(Phase::Commit))?
    }

    /// Entry point for a batch forwarded by a follower. Only the leader
    /// accepts it.
    pub async fn submit_forwarded(&self, store: StoreType, batch: Vec<u8>) -> Result<u64> {
        self.check_running()?;
        if !self.stores.read().unwrap().contains_key(&store) {
            return Err(Error::Apply(format!(
                "no local store registered for {}",
                store
            )));
        }
        MutationBatch::decode(&batch)?;
        if !self.is_leader() {
            return Err(Error::NotLeader {
                leader: self.leader(),
            });
        }
        self.propose_and_wait(store, batch, true).await
    }

    /// Takes the receiving end of the cache invalidation channel. Only the
    /// first call gets it.
    pub fn take_cache_events(&self) -> Option<mpsc::Receiver<CacheEvent>> {
        self.cache_events.lock().unwrap().take()
    }

    /// Feeds a raft message received from a peer
    pub fn step(&self, msg: Message) -> Result<()> {
        self.runtime()?.node.step(msg)
    }

    /// Proposes a command and waits until it is applied locally
    pub(crate) async fn propose_and_wait(
        &self,
        store: StoreType,
        batch: Vec<u8>,
        forwarded: bool,
    ) -> Result<u64> {
        self.check_running()?;
        let node = &self.runtime()?.node;
        let command = StoreCommand::new(node.id(), forwarded, store, batch);
        let data = command.encode()?;

        let applied = self.pending.register(command.request_id);
        // a caller that stops waiting leaves no waiter behind, the entry may
        // still be applied later
        let _waiter = self.pending.guard(command.request_id);
        let index = node.propose(data).await?;
        self.pending.bind(&command.request_id, index);
        match time::timeout(self.config.rpc_timeout(), applied).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Stopped),
            Err(_) => Err(Error::Timeout(Phase::Commit)),
        }
    }

    /// Forwards a batch to the leader and waits until the local node applied
    /// it as well
    pub(crate) async fn forward_to_leader(&self, store: StoreType, batch: Vec<u8>) -> Result<u64> {
        self.check_running()?;
        let runtime = self.runtime()?;
        let leader = match self.wait_for_leader(self.config.election_timeout()).await {
            Ok(leader) => leader,
            Err(Error::Timeout(_)) => return Err(Error::NotLeader { leader: None }),
            Err(e) => return Err(e),
        };
        if leader.id == runtime.endpoint.id {
            // raft elected this node but the state machine did not see it yet
            return Err(Error::NotLeader {
                leader: Some(leader),
            });
        }

        let index = runtime.forwarder.forward(&leader, store, batch).await?;
        self.wait_applied(index, self.config.rpc_timeout()).await?;
        Ok(index)
    }

    pub(crate) fn node(&self) -> Result<NodeHandle> {
        Ok(self.runtime()?.node.clone())
    }

    pub(crate) fn read_index_pool(&self) -> Result<Arc<WorkerPool>> {
        Ok(self.runtime()?.read_index_pool.clone())
    }

    fn runtime(&self) -> Result<&NodeRuntime> {
        self.runtime.get().ok_or_else(|| {
            Error::Startup(format!("raft group {} is not started", self.group))
        })
    }

    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        if self.flags.failed.load(Ordering::SeqCst) {
            let reason = self
                .status()
                .and_then(|status| status.fatal)
                .unwrap_or_else(|| "raft node failed".to_string());
            return Err(Error::ConsensusFatal(reason));
        }
        Ok(())
    }

    fn find_peer(&self, endpoint: &str) -> Result<Peer> {
        self.peers
            .read()
            .unwrap()
            .find_by_addr(endpoint)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "{} is not a peer of raft group {}",
                    endpoint, self.group
                ))
            })
    }

    async fn wait_for_leader(&self, timeout: Duration) -> Result<Peer> {
        let mut status = self.runtime()?.node.subscribe();
        let known = async {
            loop {
                let leader_id = status.borrow().leader_id;
                let leader = self.peers.read().unwrap().peer(leader_id);
                if let Some(leader) = leader {
                    return Ok::<_, Error>(leader);
                }
                status.changed().await.map_err(|_| Error::Stopped)?;
            }
        };
        time::timeout(timeout, known)
            .await
            .map_err(|_| Error::Timeout(Phase::Election))?
    }

    async fn wait_applied(&self, index: u64, timeout: Duration) -> Result<()> {
        let mut status = self.runtime()?.node.subscribe();
        let applied = async {
            loop {
                if status.borrow().applied >= index {
                    return Ok::<_, Error>(());
                }
                status.changed().await.map_err(|_| Error::Stopped)?;
            }
        };
        time::timeout(timeout, applied)
            .await
            .map_err(|_| Error::Timeout(Phase::Commit))?
    }
}

/// Routes messages produced by the raft node to their peers
async fn dispatch_messages(
    mut out_mailbox: mpsc::Receiver<Message>,
    transport: Arc<dyn Transport>,
    peers: Arc<RwLock<GroupConfiguration>>,
) {
    while let Some(msg) = out_mailbox.recv().await {
        let peer = peers.read().unwrap().peer(msg.to);
        match peer {
            Some(peer) => transport.send(&peer, msg).await,
            None => log::debug!("Drop raft message to unknown peer {}", msg.to),
        }
    }
}
