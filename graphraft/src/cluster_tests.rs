//! Multi node scenarios over the in-process transport

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::cache::{CacheAction, CacheEvent};
use crate::command::{EntityType, MutationBatch, StoreType};
use crate::config::{Peer, RaftConfig};
use crate::context::ClusterContext;
use crate::error::{Error, Phase};
use crate::raft_store::ReplicatedStore;
use crate::store::{BackendStore, MemoryStore};
use crate::transport::LocalNetwork;

const GROUP: &str = "graph";
const WAIT: Duration = Duration::from_secs(15);

fn endpoint(id: usize) -> String {
    format!("127.0.0.1:{}", 9000 + id)
}

fn test_config(peers: &str, path: &Path) -> RaftConfig {
    RaftConfig {
        group_peers: peers.to_string(),
        path: path.to_string_lossy().into_owned(),
        election_timeout_ms: 300,
        tick_interval_ms: 10,
        rpc_timeout_secs: 2,
        apply_timeout_secs: 10,
        queue_publish_timeout_secs: 1,
        busy_min_sleep_ms: 20,
        busy_max_sleep_ms: 40,
        read_index_threads: 2,
        snapshot_threads: 1,
        backend_threads: 2,
        pool_queue_size: 16,
        pool_keep_alive_secs: 1,
        ..Default::default()
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        time::sleep(Duration::from_millis(20)).await;
    }
}

fn vertex_batch(id: &str, value: &[u8]) -> MutationBatch {
    let mut batch = MutationBatch::new();
    batch.insert(EntityType::Vertex, id, value.to_vec());
    batch
}

struct TestNode {
    id: u64,
    context: Arc<ClusterContext>,
    stores: BTreeMap<StoreType, Arc<ReplicatedStore>>,
    backends: BTreeMap<StoreType, Arc<MemoryStore>>,
    events: mpsc::Receiver<CacheEvent>,
}

impl TestNode {
    fn new(id: u64, config: RaftConfig) -> TestNode {
        let context = ClusterContext::new(GROUP, config).unwrap();
        let mut stores = BTreeMap::new();
        let mut backends = BTreeMap::new();
        for store_type in StoreType::ALL {
            let backend = Arc::new(MemoryStore::new(store_type.to_string()));
            stores.insert(store_type, context.register(store_type, backend.clone()));
            backends.insert(store_type, backend);
        }
        let events = context.take_cache_events().unwrap();
        TestNode {
            id,
            context,
            stores,
            backends,
            events,
        }
    }

    fn graph(&self) -> &Arc<ReplicatedStore> {
        &self.stores[&StoreType::Graph]
    }

    fn vertex(&self, id: &str) -> Option<Vec<u8>> {
        self.backends[&StoreType::Graph].get(EntityType::Vertex, id)
    }

    /// Waits for the next invalidation, skipping clear-all events
    async fn next_invalidation(&mut self, within: Duration) -> Option<CacheEvent> {
        let deadline = Instant::now() + within;
        loop {
            let event = time::timeout_at(deadline, self.events.recv()).await.ok()??;
            if matches!(event.action, CacheAction::Invalidate(_)) {
                return Some(event);
            }
        }
    }
}

struct TestCluster {
    network: Arc<LocalNetwork>,
    nodes: Vec<TestNode>,
    _dir: tempfile::TempDir,
}

impl TestCluster {
    async fn start(size: usize, tweak: impl Fn(&mut RaftConfig)) -> TestCluster {
        let dir = tempfile::tempdir().unwrap();
        let peers = (1..=size).map(endpoint).collect::<Vec<_>>().join(",");
        let network = LocalNetwork::new();
        let mut nodes = Vec::new();
        for id in 1..=size {
            let mut config = test_config(&peers, &dir.path().join(format!("node{}", id)));
            tweak(&mut config);
            let node = TestNode::new(id as u64, config);
            let transport = network.join(id as u64, &node.context);
            node.context.start(&endpoint(id), transport).await.unwrap();
            nodes.push(node);
        }
        for node in &nodes {
            node.context.await_ready(WAIT, WAIT).await.unwrap();
        }
        TestCluster {
            network,
            nodes,
            _dir: dir,
        }
    }

    async fn leader(&self) -> usize {
        let mut leader = None;
        eventually("a leader", || {
            leader = self.nodes.iter().position(|node| node.context.is_leader());
            leader.is_some()
        })
        .await;
        leader.unwrap()
    }

    fn follower(&self, leader: usize) -> usize {
        (leader + 1) % self.nodes.len()
    }

    async fn shutdown(&self) {
        for node in &self.nodes {
            node.context.shutdown().await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_write_reaches_every_node() {
    let mut cluster = TestCluster::start(3, |_| {}).await;
    let leader = cluster.leader().await;

    let index = cluster.nodes[leader]
        .graph()
        .apply(&vertex_batch("v1", b"marko"))
        .await
        .unwrap();
    assert!(index > 0);
    // applied locally before apply() returns
    assert_eq!(cluster.nodes[leader].vertex("v1"), Some(b"marko".to_vec()));
    for node in &cluster.nodes {
        eventually("replicated vertex", || node.vertex("v1").is_some()).await;
    }

    // followers invalidate, the leader served the client itself
    for (i, node) in cluster.nodes.iter_mut().enumerate() {
        let event = node.next_invalidation(Duration::from_millis(500)).await;
        if i == leader {
            assert!(event.is_none(), "leader invalidated its own write");
        } else {
            let event = event.unwrap();
            assert_eq!(event.store, StoreType::Graph);
            assert_eq!(event.entity, EntityType::Vertex);
            assert_eq!(event.action, CacheAction::Invalidate(vec!["v1".to_string()]));
        }
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_write_is_forwarded() {
    let mut cluster = TestCluster::start(3, |_| {}).await;
    let leader = cluster.leader().await;
    let follower = cluster.follower(leader);

    let mut batch = MutationBatch::new();
    batch
        .insert(EntityType::Vertex, "v2", b"vadas".to_vec())
        .insert(EntityType::Edge, "e1", b"knows".to_vec());
    cluster.nodes[follower].graph().apply(&batch).await.unwrap();
    // visible on the forwarding node once apply() returns
    assert_eq!(cluster.nodes[follower].vertex("v2"), Some(b"vadas".to_vec()));

    // every node invalidates, including the leader that took the forwarded write
    for node in cluster.nodes.iter_mut() {
        let mut invalidated = Vec::new();
        while let Some(event) = node.next_invalidation(Duration::from_secs(2)).await {
            invalidated.push(event.entity);
            if invalidated.len() == 2 {
                break;
            }
        }
        invalidated.sort();
        assert_eq!(invalidated, vec![EntityType::Vertex, EntityType::Edge]);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_leader_times_out() {
    let cluster = TestCluster::start(3, |_| {}).await;
    let old_leader = cluster.leader().await;
    cluster.network.isolate(cluster.nodes[old_leader].id);

    let result = cluster.nodes[old_leader]
        .graph()
        .apply(&vertex_batch("lost", b"?"))
        .await;
    assert!(matches!(result, Err(Error::Timeout(Phase::Commit))));

    // the majority elects a new leader and keeps accepting writes
    let mut new_leader = None;
    eventually("a new leader", || {
        new_leader = cluster
            .nodes
            .iter()
            .position(|node| node.id != cluster.nodes[old_leader].id && node.context.is_leader());
        new_leader.is_some()
    })
    .await;
    let new_leader = new_leader.unwrap();
    cluster.nodes[new_leader]
        .graph()
        .apply(&vertex_batch("kept", b"!"))
        .await
        .unwrap();

    // once healed the old leader steps down and drops its uncommitted entry
    cluster.network.heal(cluster.nodes[old_leader].id);
    let old = &cluster.nodes[old_leader];
    eventually("healed node to catch up", || old.vertex("kept").is_some()).await;
    assert!(!old.context.is_leader());
    assert!(old.vertex("lost").is_none());
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_apply_timeout_bounds_a_stuck_attempt() {
    let cluster = TestCluster::start(3, |config| {
        config.rpc_timeout_secs = 30;
        config.apply_timeout_secs = 1;
    })
    .await;
    let leader = cluster.leader().await;
    cluster.network.isolate(cluster.nodes[leader].id);

    let started = Instant::now();
    let result = cluster.nodes[leader]
        .graph()
        .apply(&vertex_batch("stuck", b"?"))
        .await;
    assert!(matches!(result, Err(Error::Timeout(Phase::Commit))));
    assert!(started.elapsed() < Duration::from_secs(5));

    cluster.network.heal(cluster.nodes[leader].id);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_peer_joins_group() {
    let mut cluster = TestCluster::start(3, |_| {}).await;
    let leader = cluster.leader().await;
    cluster.nodes[leader]
        .graph()
        .apply(&vertex_batch("v8", b"before"))
        .await
        .unwrap();

    let peers = (1..=4).map(endpoint).collect::<Vec<_>>().join(",");
    let joining = TestNode::new(4, test_config(&peers, &cluster._dir.path().join("node4")));
    let transport = cluster.network.join(4, &joining.context);
    joining.context.start(&endpoint(4), transport).await.unwrap();

    cluster.nodes[leader]
        .context
        .add_peer(Peer::new(4, endpoint(4)))
        .await
        .unwrap();
    cluster.nodes.push(joining);

    // the address travels with the membership change
    for node in &cluster.nodes {
        eventually("peer 4 in membership", || {
            node.context
                .list_peers()
                .iter()
                .any(|state| state.peer.id == 4 && state.peer.addr == endpoint(4))
        })
        .await;
    }
    eventually("new peer to catch up", || cluster.nodes[3].vertex("v8").is_some()).await;

    cluster.nodes[leader]
        .graph()
        .apply(&vertex_batch("v9", b"after"))
        .await
        .unwrap();
    eventually("new peer to replicate", || cluster.nodes[3].vertex("v9").is_some()).await;

    assert!(matches!(
        cluster.nodes[leader]
            .context
            .add_peer(Peer::new(4, endpoint(4)))
            .await,
        Err(Error::Configuration(_))
    ));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lagging_follower_installs_snapshot() {
    let cluster = TestCluster::start(3, |config| config.snapshot_interval_secs = 1).await;
    let leader = cluster.leader().await;
    let lagging = cluster.follower(leader);
    cluster.network.isolate(cluster.nodes[lagging].id);

    for i in 0..20 {
        cluster.nodes[leader]
            .graph()
            .apply(&vertex_batch(&format!("s{}", i), b"row"))
            .await
            .unwrap();
    }
    // lets the leader snapshot and compact the rows away
    time::sleep(Duration::from_millis(1500)).await;
    cluster.nodes[leader]
        .graph()
        .apply(&vertex_batch("s20", b"row"))
        .await
        .unwrap();

    cluster.network.heal(cluster.nodes[lagging].id);
    let node = &cluster.nodes[lagging];
    eventually("lagging follower to catch up", || {
        node.backends[&StoreType::Graph].rows().len() == 21
    })
    .await;
    assert_eq!(node.vertex("s0"), Some(b"row".to_vec()));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_safe_read_busy_when_pool_saturated() {
    let cluster = TestCluster::start(3, |config| {
        config.safe_read = true;
        config.read_index_threads = 1;
        config.pool_queue_size = 1;
        config.rpc_timeout_secs = 3;
    })
    .await;
    let leader = cluster.leader().await;
    // read indexes of an isolated leader are never confirmed
    cluster.network.isolate(cluster.nodes[leader].id);

    // one running on the core worker, one queued, three on extra workers
    let mut blocked = Vec::new();
    for _ in 0..5 {
        let store = cluster.nodes[leader].graph().clone();
        blocked.push(tokio::spawn(async move {
            store
                .safe_read(|store| store.get(EntityType::Vertex, "v1"))
                .await
        }));
        time::sleep(Duration::from_millis(50)).await;
    }
    let result = cluster.nodes[leader]
        .graph()
        .safe_read(|store| store.get(EntityType::Vertex, "v1"))
        .await;
    assert!(matches!(result, Err(Error::Busy)));

    for read in blocked {
        assert!(matches!(
            read.await.unwrap(),
            Err(Error::Timeout(Phase::ReadIndex))
        ));
    }
    cluster.network.heal(cluster.nodes[leader].id);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_safe_read_sees_committed_write() {
    let cluster = TestCluster::start(3, |config| config.safe_read = true).await;
    let leader = cluster.leader().await;
    let follower = cluster.follower(leader);

    cluster.nodes[leader]
        .graph()
        .apply(&vertex_batch("v3", b"josh"))
        .await
        .unwrap();
    let value = cluster.nodes[follower]
        .graph()
        .safe_read(|store| store.get(EntityType::Vertex, "v3"))
        .await
        .unwrap();
    assert_eq!(value, Some(b"josh".to_vec()));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_without_forwarding_rejects_writes() {
    let cluster = TestCluster::start(3, |config| config.forward_writes = false).await;
    let leader = cluster.leader().await;
    let follower = cluster.follower(leader);

    let result = cluster.nodes[follower]
        .graph()
        .apply(&vertex_batch("v4", b"peter"))
        .await;
    match result {
        Err(Error::NotLeader { leader: Some(peer) }) => {
            assert_eq!(peer.id, cluster.nodes[leader].id)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(cluster.nodes[follower].vertex("v4").is_none());
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_and_remove_peer() {
    let cluster = TestCluster::start(3, |_| {}).await;
    let leader = cluster.leader().await;
    let target = cluster.follower(leader);

    cluster.nodes[leader]
        .context
        .transfer_leadership(&endpoint(target + 1))
        .await
        .unwrap();
    eventually("transferee to lead", || cluster.nodes[target].context.is_leader()).await;
    // commits an entry of the new term so no membership change is pending
    cluster.nodes[target]
        .graph()
        .apply(&vertex_batch("v7", b"lop"))
        .await
        .unwrap();

    let removed = cluster.follower(target);
    let removed_id = cluster.nodes[removed].id;
    cluster.nodes[target].context.remove_peer(removed_id).await.unwrap();
    let peers = cluster.nodes[target].context.list_peers();
    assert_eq!(peers.len(), 2);
    assert!(peers.iter().all(|state| state.peer.id != removed_id));

    assert!(matches!(
        cluster.nodes[target].context.remove_peer(removed_id).await,
        Err(Error::Configuration(_))
    ));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_replays_log() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&endpoint(1), &dir.path().join("node1"));
    {
        let node = TestNode::new(1, config.clone());
        let network = LocalNetwork::new();
        let transport = network.join(1, &node.context);
        node.context.start(&endpoint(1), transport).await.unwrap();
        node.context.await_ready(WAIT, WAIT).await.unwrap();
        node.graph().apply(&vertex_batch("v5", b"ripple")).await.unwrap();
        node.context.shutdown().await;
    }

    let node = TestNode::new(1, config);
    let network = LocalNetwork::new();
    let transport = network.join(1, &node.context);
    node.context.start(&endpoint(1), transport).await.unwrap();
    node.context.await_ready(WAIT, WAIT).await.unwrap();
    eventually("log replay", || node.vertex("v5").is_some()).await;
    node.context.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_is_idempotent() {
    let cluster = TestCluster::start(1, |_| {}).await;
    let node = &cluster.nodes[0];
    node.context.shutdown().await;
    node.context.shutdown().await;
    assert!(!node.context.is_leader());
    assert!(matches!(
        node.graph().apply(&vertex_batch("v6", b"lop")).await,
        Err(Error::Stopped)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_quorum_times_out_election() {
    let dir = tempfile::tempdir().unwrap();
    let peers = (1..=3).map(endpoint).collect::<Vec<_>>().join(",");
    let node = TestNode::new(1, test_config(&peers, dir.path()));
    let network = LocalNetwork::new();
    let transport = network.join(1, &node.context);
    node.context.start(&endpoint(1), transport).await.unwrap();

    let result = node
        .context
        .await_ready(Duration::from_secs(1), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(Error::Timeout(Phase::Election))));
    node.context.shutdown().await;
}

#[tokio::test]
async fn test_startup_errors() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"x").unwrap();

    let node = TestNode::new(1, test_config(&endpoint(1), &file));
    let network = LocalNetwork::new();
    let result = node
        .context
        .start(&endpoint(1), network.join(1, &node.context))
        .await;
    assert!(matches!(result, Err(Error::Startup(_))));

    let stranger = TestNode::new(1, test_config(&endpoint(1), dir.path()));
    let result = stranger
        .context
        .start(&endpoint(7), network.join(7, &stranger.context))
        .await;
    assert!(matches!(result, Err(Error::Startup(_))));
}

#[test]
fn test_invalid_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&endpoint(1), dir.path());
    config.busy_min_sleep_ms = 100;
    config.busy_max_sleep_ms = 10;
    assert!(matches!(
        ClusterContext::new(GROUP, config),
        Err(Error::Configuration(_))
    ));

    let config = test_config("127.0.0.1:9001,7@127.0.0.1:9002", dir.path());
    assert!(matches!(
        ClusterContext::new(GROUP, config),
        Err(Error::Configuration(_))
    ));
}

#[test]
#[should_panic(expected = "already registered")]
fn test_register_twice_panics() {
    let dir = tempfile::tempdir().unwrap();
    let context = ClusterContext::new(GROUP, test_config(&endpoint(1), dir.path())).unwrap();
    context.register(StoreType::Graph, Arc::new(MemoryStore::new("graph")));
    context.register(StoreType::Graph, Arc::new(MemoryStore::new("graph")));
}
