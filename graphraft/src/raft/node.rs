//! Raft node implementation
//!
//! A node owns the `RawNode` and drives it from a single task: inbound
//! messages, proposals and ticks are fed in, and every `Ready` is persisted,
//! sent out and applied to the state machine in the order raft requires.

#![allow(clippy::field_reassign_with_default)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use slog::Drain;
use slog::o;
use tokio::sync::mpsc::{self, error::SendTimeoutError, Receiver, Sender};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use uuid::Uuid;

use protobuf::Message as PbMessage;
use raft::{prelude::*, ReadOnlyOption, StateRole};

use crate::config::{GroupConfiguration, Peer, RaftConfig};
use crate::error::{Error, Result};
use crate::raft::proposal::Proposal;
use crate::raft::{NodeStatus, StateMachine};

use super::storage::FileStorage;

const LOGGER_CHANNEL_SIZE: usize = 4096;
const OUT_MAILBOX_SIZE: usize = 4096;
const MAX_SIZE_PER_MSG: u64 = 1 << 20;

/// Snapshot payload: state machine image plus the peer addresses, which the
/// conf state alone does not carry.
#[derive(Serialize, Deserialize)]
struct SnapshotImage {
    peers: Vec<(u64, String)>,
    data: Vec<u8>,
}

fn raft_config(id: u64, applied: u64, conf: &RaftConfig) -> Result<Config> {
    let read_only_option = conf.read_only_option()?;
    let cfg = Config {
        id,
        election_tick: conf.election_tick(),
        heartbeat_tick: conf.heartbeat_tick(),
        applied,
        max_size_per_msg: MAX_SIZE_PER_MSG,
        max_inflight_msgs: conf.replicator_pipeline,
        check_quorum: read_only_option == ReadOnlyOption::LeaseBased,
        read_only_option,
        pre_vote: true,
        ..Default::default()
    };
    cfg.validate()
        .map_err(|e| Error::Configuration(e.to_string()))?;
    Ok(cfg)
}

fn raft_logger(id: u64) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Drop)
        .build()
        .filter_level(slog::Level::Info)
        .fuse();
    slog::Logger::root(drain, o!("tag" => format!("peer_{}", id)))
}

fn fatal(e: raft::Error) -> Error {
    Error::ConsensusFatal(e.to_string())
}

/// Waits for the state machine to load the snapshot at `index`
async fn await_snapshot_load(
    loaded: oneshot::Receiver<Result<()>>,
    index: u64,
    timeout: Duration,
) -> Result<()> {
    match time::timeout(timeout, loaded).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(Error::ConsensusFatal(format!(
            "failed to load snapshot at index {}: {}",
            index, e
        ))),
        Ok(Err(_)) => Err(Error::Stopped),
        Err(_) => Err(Error::ConsensusFatal(format!(
            "loading snapshot at index {} took longer than {:?}",
            index, timeout
        ))),
    }
}

/// Cloneable entry point into a running node
#[derive(Clone)]
pub struct NodeHandle {
    id: u64,
    mailbox: UnboundedSender<Message>,
    proposals: Sender<Proposal>,
    status: watch::Receiver<NodeStatus>,
    shutdown: Arc<watch::Sender<bool>>,
    publish_timeout: Duration,
}

impl NodeHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Feeds a message received from a peer
    pub fn step(&self, msg: Message) -> Result<()> {
        self.mailbox.send(msg).map_err(|_| Error::Stopped)
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Queues a proposal, waiting at most the publish timeout for room
    async fn publish(&self, proposal: Proposal) -> Result<()> {
        match self
            .proposals
            .send_timeout(proposal, self.publish_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                log::warn!(
                    "Raft proposal queue of node {} is full, rejecting proposal",
                    self.id
                );
                Err(Error::Busy)
            }
            Err(SendTimeoutError::Closed(_)) => Err(Error::Stopped),
        }
    }

    /// Appends `data` to the leader's log and returns its index
    pub async fn propose(&self, data: Vec<u8>) -> Result<u64> {
        let (proposal, rx) = Proposal::normal(data);
        self.publish(proposal).await?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    /// Returns once the membership change is applied locally
    pub async fn propose_conf_change(&self, cc: &ConfChange) -> Result<()> {
        let (proposal, rx) = Proposal::conf_change(cc);
        self.publish(proposal).await?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    pub async fn transfer_leader(&self, transferee: u64) -> Result<()> {
        let (proposal, rx) = Proposal::transfer_leader(transferee);
        self.publish(proposal).await?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    /// Confirms leadership through a read index and waits until the local
    /// apply cursor reaches it
    pub async fn read_index(&self) -> Result<u64> {
        let (proposal, rx) = Proposal::read_index();
        self.publish(proposal).await?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Raft node implementation
pub struct Node<S: StateMachine> {
    id: u64,
    raft_group: RawNode<FileStorage>,
    out_mailbox: Sender<Message>,
    my_mailbox: UnboundedReceiver<Message>,
    proposals: Receiver<Proposal>,
    state_machine: S,
    peers: Arc<RwLock<GroupConfiguration>>,
    status: watch::Sender<NodeStatus>,
    shutdown: watch::Receiver<bool>,
    // membership changes waiting for the entry at the given index
    pending_conf: Vec<(u64, oneshot::Sender<Result<()>>)>,
    read_waiters: HashMap<Vec<u8>, oneshot::Sender<Result<u64>>>,
    read_ready: Vec<(u64, oneshot::Sender<Result<u64>>)>,
    role: StateRole,
    applied: u64,
    apply_batch: usize,
    tick_interval: Duration,
    snapshot_interval: Duration,
    install_snapshot_timeout: Duration,
    last_snapshot_at: Instant,
}

impl<S: StateMachine> Node<S> {
    /// Starts a raft node over `storage`.
    ///
    /// Returns the handle, the mailbox of messages addressed to other peers
    /// and the task running the node.
    pub async fn start(
        id: u64,
        config: &RaftConfig,
        storage: FileStorage,
        mut state_machine: S,
        peers: Arc<RwLock<GroupConfiguration>>,
    ) -> Result<(NodeHandle, Receiver<Message>, JoinHandle<()>)> {
        *peers.write().unwrap() = storage.peers().clone();

        let applied = storage.snapshot_index();
        if let Some(snapshot) = storage.last_snapshot() {
            let metadata = snapshot.get_metadata();
            let image: SnapshotImage = bincode::deserialize(&snapshot.get_data()[..])?;
            let loaded = state_machine.on_snapshot_load(metadata.index, metadata.term, image.data);
            await_snapshot_load(loaded, metadata.index, config.install_snapshot_timeout()).await?;
            log::info!(
                "Node {} restored snapshot at index {}, term {}",
                id,
                metadata.index,
                metadata.term
            );
        }

        let cfg = raft_config(id, applied, config)?;
        let logger = raft_logger(id);
        let raft_group = RawNode::new(&cfg, storage, &logger)
            .map_err(|e| Error::Startup(format!("failed to create raft node {}: {}", id, e)))?;

        let (mailbox_tx, my_mailbox) = mpsc::unbounded_channel();
        let (proposals_tx, proposals) = mpsc::channel(config.queue_size);
        let (out_tx, out_mailbox) = mpsc::channel(OUT_MAILBOX_SIZE);
        let (status_tx, status_rx) = watch::channel(NodeStatus {
            id,
            applied,
            ..Default::default()
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let node = Node {
            id,
            raft_group,
            out_mailbox: out_tx,
            my_mailbox,
            proposals,
            state_machine,
            peers,
            status: status_tx,
            shutdown: shutdown_rx,
            pending_conf: Vec::new(),
            read_waiters: HashMap::new(),
            read_ready: Vec::new(),
            role: StateRole::Follower,
            applied,
            apply_batch: config.apply_batch,
            tick_interval: config.tick_interval(),
            snapshot_interval: config.snapshot_interval(),
            install_snapshot_timeout: config.install_snapshot_timeout(),
            last_snapshot_at: Instant::now(),
        };
        let task = tokio::spawn(node.run());

        let handle = NodeHandle {
            id,
            mailbox: mailbox_tx,
            proposals: proposals_tx,
            status: status_rx,
            shutdown: Arc::new(shutdown_tx),
            publish_timeout: config.queue_publish_timeout(),
        };
        Ok((handle, out_mailbox, task))
    }

    async fn run(mut self) {
        log::info!("Raft node {} started", self.id);
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                Some(msg) = self.my_mailbox.recv() => {
                    self.step(msg);
                    while let Ok(msg) = self.my_mailbox.try_recv() {
                        self.step(msg);
                    }
                }
                Some(proposal) = self.proposals.recv() => {
                    self.propose(proposal);
                    while let Ok(proposal) = self.proposals.try_recv() {
                        self.propose(proposal);
                    }
                }
                _ = ticker.tick() => {
                    self.raft_group.tick();
                    self.read_waiters.retain(|_, tx| !tx.is_closed());
                    self.read_ready.retain(|(_, tx)| !tx.is_closed());
                }
            }

            let mut result = self.on_ready().await;
            if result.is_ok() && self.last_snapshot_at.elapsed() >= self.snapshot_interval {
                self.last_snapshot_at = Instant::now();
                result = self.save_snapshot().await;
            }
            if let Err(e) = result {
                self.fail(e);
                break;
            }
            self.publish_status();
        }

        self.close();
        log::info!("Raft node {} stopped", self.id);
    }

    fn step(&mut self, msg: Message) {
        if let Err(e) = self.raft_group.step(msg) {
            log::debug!("Node {} dropped raft message: {}", self.id, e);
        }
    }

    fn not_leader(&self) -> Error {
        let leader_id = self.raft_group.raft.leader_id;
        Error::NotLeader {
            leader: self.peers.read().unwrap().peer(leader_id),
        }
    }

    fn is_leader(&self) -> bool {
        self.raft_group.raft.state == StateRole::Leader
    }

    /// Hands a proposal to raft if this node is the leader
    fn propose(&mut self, proposal: Proposal) {
        match proposal {
            Proposal::Normal { data, accepted } => {
                let result = if !self.is_leader() {
                    Err(self.not_leader())
                } else {
                    let index = self.raft_group.raft.raft_log.last_index() + 1;
                    match self.raft_group.propose(vec![], data) {
                        Ok(()) if self.raft_group.raft.raft_log.last_index() >= index => Ok(index),
                        // leadership transfer in progress
                        Ok(()) | Err(raft::Error::ProposalDropped) => Err(Error::Busy),
                        Err(e) => Err(fatal(e)),
                    }
                };
                let _ = accepted.send(result);
            }
            Proposal::ConfChange { cc, applied } => {
                if !self.is_leader() {
                    let _ = applied.send(Err(self.not_leader()));
                    return;
                }
                let index = self.raft_group.raft.raft_log.last_index() + 1;
                match self.raft_group.propose_conf_change(vec![], cc) {
                    Ok(()) if self.raft_group.raft.raft_log.last_index() >= index => {
                        self.pending_conf.push((index, applied));
                    }
                    Ok(()) | Err(raft::Error::ProposalDropped) => {
                        let _ = applied.send(Err(Error::Busy));
                    }
                    Err(e) => {
                        let _ = applied.send(Err(Error::Configuration(e.to_string())));
                    }
                }
            }
            Proposal::TransferLeader { transferee, done } => {
                if !self.is_leader() {
                    let _ = done.send(Err(self.not_leader()));
                    return;
                }
                log::info!("Node {} transfers leadership to {}", self.id, transferee);
                self.raft_group.transfer_leader(transferee);
                let _ = done.send(Ok(()));
            }
            Proposal::ReadIndex { ready } => {
                let ctx = Uuid::new_v4().as_bytes().to_vec();
                self.raft_group.read_index(ctx.clone());
                self.read_waiters.insert(ctx, ready);
            }
        }
    }

    /// Process raft ready state
    async fn on_ready(&mut self) -> Result<()> {
        if !self.raft_group.has_ready() {
            return Ok(());
        }

        let mut ready = self.raft_group.ready();

        // Step 1: Observe role changes
        if let Some(ss) = ready.ss() {
            self.on_soft_state(ss.raft_state, ss.leader_id);
        }

        // Step 2: Leaders may send before persisting
        if !ready.messages().is_empty() {
            self.send_messages(ready.take_messages());
        }

        // Step 3: Install a snapshot sent by the leader
        if *ready.snapshot() != Snapshot::default() {
            let snapshot = ready.snapshot().clone();
            self.install_snapshot(snapshot).await?;
        }

        // Step 4: Apply committed entries
        self.handle_committed_entries(ready.take_committed_entries())?;

        // Step 5: Record confirmed read indexes
        for rs in ready.take_read_states() {
            if let Some(waiter) = self.read_waiters.remove(rs.request_ctx.as_slice()) {
                self.read_ready.push((rs.index, waiter));
            }
        }
        self.release_reads();

        // Step 6: Persist raft state
        {
            let store = self.raft_group.mut_store();
            store.append_entries(ready.entries()).map_err(fatal)?;
            if let Some(hs) = ready.hs() {
                store.set_hardstate(hs.clone()).map_err(fatal)?;
            }
        }
        if !ready.persisted_messages().is_empty() {
            self.send_messages(ready.take_persisted_messages());
        }

        // Step 7: Advance raft state
        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.raft_group.mut_store().set_commit(commit).map_err(fatal)?;
        }
        self.send_messages(light_rd.take_messages());
        self.handle_committed_entries(light_rd.take_committed_entries())?;
        self.release_reads();
        self.raft_group.advance_apply();
        Ok(())
    }

    fn on_soft_state(&mut self, role: StateRole, leader_id: u64) {
        if role == self.role {
            return;
        }
        let term = self.raft_group.raft.term;
        log::info!(
            "Node {} becomes {:?} at term {}, leader is {}",
            self.id,
            role,
            term,
            leader_id
        );
        if role == StateRole::Leader {
            self.state_machine.on_leader_start(term);
        } else if self.role == StateRole::Leader {
            self.state_machine.on_leader_stop();
        }
        self.role = role;
    }

    fn send_messages(&self, messages: Vec<Message>) {
        for msg in messages {
            if let Err(e) = self.out_mailbox.try_send(msg) {
                log::error!("Failed to send raft message {:?}, Raft will retry", e);
            }
        }
    }

    fn handle_committed_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        for batch in entries.chunks(self.apply_batch.max(1)) {
            for entry in batch {
                match entry.get_entry_type() {
                    EntryType::EntryNormal => {
                        if !entry.data.is_empty() {
                            self.state_machine.on_apply(entry.index, &entry.data[..]);
                        }
                        // a conf change replaced by raft while another was pending
                        self.resolve_conf(entry.index, || Err(Error::Busy));
                    }
                    EntryType::EntryConfChange => self.apply_conf_change(entry)?,
                    EntryType::EntryConfChangeV2 => {
                        log::warn!(
                            "Node {} ignores unsupported conf change v2 at {}",
                            self.id,
                            entry.index
                        );
                    }
                }
                self.applied = entry.index;
            }
            self.release_reads();
        }
        Ok(())
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<()> {
        let mut cc = ConfChange::default();
        cc.merge_from_bytes(&entry.data[..])
            .map_err(|e| Error::ConsensusFatal(format!("corrupted conf change: {}", e)))?;

        let cs = match self.raft_group.apply_conf_change(&cc) {
            Ok(cs) => cs,
            Err(e) => {
                log::warn!("Node {} rejects conf change {:?}: {}", self.id, cc, e);
                let message = e.to_string();
                self.resolve_conf(entry.index, || Err(Error::Configuration(message)));
                return Ok(());
            }
        };

        let peers = {
            let mut peers = self.peers.write().unwrap();
            match cc.get_change_type() {
                ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                    let addr = String::from_utf8_lossy(&cc.context[..]).to_string();
                    if !addr.is_empty() && !peers.contains(cc.node_id) {
                        if let Err(e) = peers.insert(Peer::new(cc.node_id, addr)) {
                            log::warn!("Node {} can't record peer {}: {}", self.id, cc.node_id, e);
                        }
                    }
                }
                ConfChangeType::RemoveNode => {
                    peers.remove(cc.node_id);
                }
            }
            peers.clone()
        };
        let store = self.raft_group.mut_store();
        store.set_conf_state(cs).map_err(fatal)?;
        store.set_peers(peers).map_err(fatal)?;

        log::info!(
            "Node {} applied conf change {:?} of node {} at {}",
            self.id,
            cc.get_change_type(),
            cc.node_id,
            entry.index
        );
        if cc.node_id == self.id && cc.get_change_type() == ConfChangeType::RemoveNode {
            log::warn!("Node {} was removed from the group", self.id);
        }
        self.resolve_conf(entry.index, || Ok(()));
        Ok(())
    }

    fn resolve_conf<F: FnOnce() -> Result<()>>(&mut self, index: u64, result: F) {
        if let Some(pos) = self.pending_conf.iter().position(|(i, _)| *i == index) {
            let (_, tx) = self.pending_conf.swap_remove(pos);
            let _ = tx.send(result());
        }
    }

    fn release_reads(&mut self) {
        let applied = self.applied;
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.read_ready)
            .into_iter()
            .partition(|(index, _)| *index <= applied);
        self.read_ready = waiting;
        for (index, tx) in ready {
            let _ = tx.send(Ok(index));
        }
    }

    async fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let (index, term) = {
            let metadata = snapshot.get_metadata();
            (metadata.index, metadata.term)
        };
        let image: SnapshotImage = bincode::deserialize(&snapshot.get_data()[..])?;

        let mut peers = GroupConfiguration::default();
        for (id, addr) in image.peers {
            peers.insert(Peer::new(id, addr))?;
        }
        {
            let store = self.raft_group.mut_store();
            store.apply_snapshot(&snapshot).map_err(fatal)?;
            store.set_peers(peers.clone()).map_err(fatal)?;
        }
        *self.peers.write().unwrap() = peers;

        let loaded = self.state_machine.on_snapshot_load(index, term, image.data);
        await_snapshot_load(loaded, index, self.install_snapshot_timeout).await?;
        self.applied = index;
        log::info!("Node {} installed snapshot at index {}, term {}", self.id, index, term);
        Ok(())
    }

    /// Saves a snapshot if anything was applied since the last one
    async fn save_snapshot(&mut self) -> Result<()> {
        let applied = self.applied;
        if applied <= self.raft_group.store().snapshot_index() {
            return Ok(());
        }

        let data = match self.state_machine.on_snapshot_save().await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                log::error!("Node {} failed to take snapshot: {}", self.id, e);
                return Ok(());
            }
            Err(_) => {
                log::warn!("Node {} snapshot job was dropped", self.id);
                return Ok(());
            }
        };
        let image = SnapshotImage {
            peers: self
                .peers
                .read()
                .unwrap()
                .peers()
                .into_iter()
                .map(|p| (p.id, p.addr))
                .collect(),
            data,
        };
        let data = bincode::serialize(&image)?;
        self.raft_group
            .mut_store()
            .save_snapshot(data, applied)
            .map_err(fatal)?;
        log::info!("Node {} saved snapshot at index {}", self.id, applied);
        Ok(())
    }

    fn publish_status(&self) {
        let raft = &self.raft_group.raft;
        let status = NodeStatus {
            id: self.id,
            role: raft.state,
            leader_id: raft.leader_id,
            term: raft.term,
            commit: raft.raft_log.committed,
            applied: self.applied,
            fatal: None,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn fail(&mut self, error: Error) {
        log::error!("Raft node {} failed: {}", self.id, error);
        self.state_machine.on_error(&error);
        let message = error.to_string();
        self.status.send_modify(|status| status.fatal = Some(message));
    }

    /// Answers everything still waiting on this node
    fn close(&mut self) {
        self.proposals.close();
        while let Ok(proposal) = self.proposals.try_recv() {
            proposal.reject(Error::Stopped);
        }
        for (_, tx) in self.pending_conf.drain(..) {
            let _ = tx.send(Err(Error::Stopped));
        }
        for (_, tx) in self.read_waiters.drain() {
            let _ = tx.send(Err(Error::Stopped));
        }
        for (_, tx) in self.read_ready.drain(..) {
            let _ = tx.send(Err(Error::Stopped));
        }
        if self.role == StateRole::Leader {
            self.state_machine.on_leader_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raft_config_from_settings() {
        let mut conf = RaftConfig::default();
        conf.election_timeout_ms = 1000;
        conf.tick_interval_ms = 100;
        let cfg = raft_config(1, 7, &conf).unwrap();
        assert_eq!(cfg.election_tick, 10);
        assert_eq!(cfg.heartbeat_tick, 1);
        assert_eq!(cfg.applied, 7);
        assert!(!cfg.check_quorum);

        conf.read_strategy = "ReadOnlyLeaseBased".to_string();
        let cfg = raft_config(1, 0, &conf).unwrap();
        assert!(cfg.check_quorum);
        assert_eq!(cfg.read_only_option, ReadOnlyOption::LeaseBased);
    }

    #[tokio::test]
    async fn test_publish_busy_when_queue_full() {
        let (mailbox, _my_mailbox) = mpsc::unbounded_channel();
        let (proposals, _queue) = mpsc::channel(1);
        let (_status_tx, status) = watch::channel(NodeStatus::default());
        let (shutdown, _) = watch::channel(false);
        let handle = NodeHandle {
            id: 1,
            mailbox,
            proposals,
            status,
            shutdown: Arc::new(shutdown),
            publish_timeout: Duration::from_millis(50),
        };

        let (first, _rx) = Proposal::normal(vec![1]);
        handle.publish(first).await.unwrap();
        let started = Instant::now();
        let (second, _rx) = Proposal::normal(vec![2]);
        assert!(matches!(handle.publish(second).await, Err(Error::Busy)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_snapshot_load_bounded_by_timeout() {
        let (done, loaded) = oneshot::channel();
        done.send(Ok(())).unwrap();
        await_snapshot_load(loaded, 3, Duration::from_secs(1))
            .await
            .unwrap();

        let (done, loaded) = oneshot::channel();
        done.send(Err(Error::Busy)).unwrap();
        assert!(matches!(
            await_snapshot_load(loaded, 3, Duration::from_secs(1)).await,
            Err(Error::ConsensusFatal(_))
        ));

        // a load that never finishes
        let (_done, loaded) = oneshot::channel::<Result<()>>();
        let started = Instant::now();
        assert!(matches!(
            await_snapshot_load(loaded, 3, Duration::from_millis(50)).await,
            Err(Error::ConsensusFatal(_))
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));

        let (done, loaded) = oneshot::channel::<Result<()>>();
        drop(done);
        assert!(matches!(
            await_snapshot_load(loaded, 3, Duration::from_secs(1)).await,
            Err(Error::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_publish_after_stop() {
        let (mailbox, _my_mailbox) = mpsc::unbounded_channel();
        let (proposals, queue) = mpsc::channel(4);
        let (_status_tx, status) = watch::channel(NodeStatus::default());
        let (shutdown, _) = watch::channel(false);
        let handle = NodeHandle {
            id: 1,
            mailbox,
            proposals,
            status,
            shutdown: Arc::new(shutdown),
            publish_timeout: Duration::from_millis(50),
        };
        drop(queue);
        assert!(matches!(handle.propose(vec![1]).await, Err(Error::Stopped)));
    }
}
