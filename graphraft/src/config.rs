use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use log::warn;
use serde_derive::Deserialize;

use crate::error::{Error, Result};

/// One member of a consensus group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub id: u64,
    pub addr: String,
}

impl Peer {
    pub fn new(id: u64, addr: impl Into<String>) -> Self {
        Peer {
            id,
            addr: addr.into(),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

impl FromStr for Peer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id, addr) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| Error::Configuration(format!("peer '{}' is not id@host:port", s)))?;
        let id = id
            .parse::<u64>()
            .map_err(|_| Error::Configuration(format!("invalid peer id in '{}'", s)))?;
        if id == 0 {
            return Err(Error::Configuration(format!("peer id must not be 0: '{}'", s)));
        }
        check_addr(addr)?;
        Ok(Peer::new(id, addr))
    }
}

fn check_addr(addr: &str) -> Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Configuration(format!("peer address '{}' has no port", addr)))?;
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(Error::Configuration(format!(
            "peer address '{}' has an invalid host",
            addr
        )));
    }
    port.parse::<u16>()
        .map_err(|_| Error::Configuration(format!("peer address '{}' has an invalid port", addr)))?;
    Ok(())
}

/// The set of peers forming a consensus group, keyed by raft node id.
///
/// Peer lists are written either as plain `host:port` entries, which get ids
/// `1..=n` by position, or as `id@host:port` entries. Every node of a group
/// must be given the same list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupConfiguration {
    peers: BTreeMap<u64, String>,
}

impl GroupConfiguration {
    pub fn parse(list: &str) -> Result<Self> {
        let entries: Vec<&str> = list.split(',').map(str::trim).collect();
        if entries.iter().all(|e| e.is_empty()) {
            return Err(Error::Configuration("group peers must not be empty".into()));
        }
        if let Some(pos) = entries.iter().position(|e| e.is_empty()) {
            return Err(Error::Configuration(format!(
                "empty peer at position {} in '{}'",
                pos + 1,
                list
            )));
        }

        let explicit = entries.iter().filter(|e| e.contains('@')).count();
        if explicit != 0 && explicit != entries.len() {
            return Err(Error::Configuration(format!(
                "peers must either all carry ids or none: '{}'",
                list
            )));
        }

        let mut group = GroupConfiguration::default();
        for (i, entry) in entries.iter().enumerate() {
            let peer = if explicit == 0 {
                check_addr(entry)?;
                Peer::new(i as u64 + 1, *entry)
            } else {
                entry.parse::<Peer>()?
            };
            group.insert(peer)?;
        }
        Ok(group)
    }

    pub fn insert(&mut self, peer: Peer) -> Result<()> {
        if self.peers.contains_key(&peer.id) {
            return Err(Error::Configuration(format!("duplicate peer id {}", peer.id)));
        }
        if self.find_by_addr(&peer.addr).is_some() {
            return Err(Error::Configuration(format!(
                "duplicate peer address {}",
                peer.addr
            )));
        }
        self.peers.insert(peer.id, peer.addr);
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<Peer> {
        self.peers.remove(&id).map(|addr| Peer::new(id, addr))
    }

    pub fn peer(&self, id: u64) -> Option<Peer> {
        self.peers.get(&id).map(|addr| Peer::new(id, addr.clone()))
    }

    pub fn find_by_addr(&self, addr: &str) -> Option<Peer> {
        self.peers
            .iter()
            .find(|(_, a)| a.as_str() == addr)
            .map(|(id, a)| Peer::new(*id, a.clone()))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.peers.keys().copied().collect()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .map(|(id, addr)| Peer::new(*id, addr.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Options of the replication layer. Every option has a default; `validate`
/// rejects values that cannot work before anything is started.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RaftConfig {
    pub group_peers: String,
    pub path: String,
    pub safe_read: bool,
    pub read_strategy: String,
    pub forward_writes: bool,
    pub election_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub snapshot_interval_secs: u64,
    pub apply_batch: usize,
    pub queue_size: usize,
    pub queue_publish_timeout_secs: u64,
    pub replicator_pipeline: usize,
    pub read_index_threads: usize,
    pub snapshot_threads: usize,
    pub backend_threads: usize,
    pub pool_queue_size: usize,
    pub pool_keep_alive_secs: u64,
    pub rpc_connect_timeout_ms: u64,
    pub rpc_timeout_secs: u64,
    pub install_snapshot_timeout_secs: u64,
    pub apply_timeout_secs: u64,
    pub busy_min_sleep_ms: u64,
    pub busy_max_sleep_ms: u64,
    pub wait_leader_timeout_secs: u64,
    pub wait_log_sync_timeout_secs: u64,
    pub cache_event_queue_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            group_peers: String::new(),
            path: "./raft-log".to_string(),
            safe_read: false,
            read_strategy: "ReadOnlySafe".to_string(),
            forward_writes: true,
            election_timeout_ms: 10_000,
            tick_interval_ms: 100,
            snapshot_interval_secs: 3600,
            apply_batch: 1,
            queue_size: 16384,
            queue_publish_timeout_secs: 60,
            replicator_pipeline: 256,
            read_index_threads: 8,
            snapshot_threads: 4,
            backend_threads: cpus(),
            pool_queue_size: cpus(),
            pool_keep_alive_secs: 300,
            rpc_connect_timeout_ms: 5000,
            rpc_timeout_secs: 60,
            install_snapshot_timeout_secs: 3600,
            apply_timeout_secs: 1800,
            busy_min_sleep_ms: 3000,
            busy_max_sleep_ms: 5000,
            wait_leader_timeout_secs: 600,
            wait_log_sync_timeout_secs: 1800,
            cache_event_queue_size: 1024,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(Error::Configuration(format!("{} must be positive", name)));
            }
            Ok(())
        }

        positive("election_timeout_ms", self.election_timeout_ms)?;
        positive("tick_interval_ms", self.tick_interval_ms)?;
        positive("snapshot_interval_secs", self.snapshot_interval_secs)?;
        positive("apply_batch", self.apply_batch as u64)?;
        positive("queue_size", self.queue_size as u64)?;
        positive("queue_publish_timeout_secs", self.queue_publish_timeout_secs)?;
        positive("replicator_pipeline", self.replicator_pipeline as u64)?;
        positive("read_index_threads", self.read_index_threads as u64)?;
        positive("snapshot_threads", self.snapshot_threads as u64)?;
        positive("backend_threads", self.backend_threads as u64)?;
        positive("pool_queue_size", self.pool_queue_size as u64)?;
        positive("pool_keep_alive_secs", self.pool_keep_alive_secs)?;
        positive("rpc_connect_timeout_ms", self.rpc_connect_timeout_ms)?;
        positive("rpc_timeout_secs", self.rpc_timeout_secs)?;
        positive("install_snapshot_timeout_secs", self.install_snapshot_timeout_secs)?;
        positive("apply_timeout_secs", self.apply_timeout_secs)?;
        positive("wait_leader_timeout_secs", self.wait_leader_timeout_secs)?;
        positive("wait_log_sync_timeout_secs", self.wait_log_sync_timeout_secs)?;
        positive("cache_event_queue_size", self.cache_event_queue_size as u64)?;

        if self.election_timeout_ms < 2 * self.tick_interval_ms {
            return Err(Error::Configuration(format!(
                "election_timeout_ms ({}) must be at least two ticks ({} ms each)",
                self.election_timeout_ms, self.tick_interval_ms
            )));
        }
        if self.busy_min_sleep_ms > self.busy_max_sleep_ms {
            return Err(Error::Configuration(format!(
                "busy_min_sleep_ms ({}) is greater than busy_max_sleep_ms ({})",
                self.busy_min_sleep_ms, self.busy_max_sleep_ms
            )));
        }
        if self.path.trim().is_empty() {
            return Err(Error::Configuration("path must not be empty".into()));
        }
        self.read_only_option()?;
        Ok(())
    }

    pub fn read_only_option(&self) -> Result<raft::ReadOnlyOption> {
        match self.read_strategy.as_str() {
            "ReadOnlySafe" => Ok(raft::ReadOnlyOption::Safe),
            "ReadOnlyLeaseBased" => Ok(raft::ReadOnlyOption::LeaseBased),
            other => Err(Error::Configuration(format!(
                "unknown read_strategy '{}', expect ReadOnlySafe or ReadOnlyLeaseBased",
                other
            ))),
        }
    }

    /// Election timeout expressed in raft ticks
    pub fn election_tick(&self) -> usize {
        (self.election_timeout_ms / self.tick_interval_ms) as usize
    }

    /// Heartbeats are sent ten times per election timeout
    pub fn heartbeat_tick(&self) -> usize {
        (self.election_tick() / 10).max(1)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn queue_publish_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_publish_timeout_secs)
    }

    pub fn pool_keep_alive(&self) -> Duration {
        Duration::from_secs(self.pool_keep_alive_secs)
    }

    pub fn rpc_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_connect_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn install_snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.install_snapshot_timeout_secs)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn busy_sleep_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.busy_min_sleep_ms),
            Duration::from_millis(self.busy_max_sleep_ms),
        )
    }

    pub fn wait_leader_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_leader_timeout_secs)
    }

    pub fn wait_log_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_log_sync_timeout_secs)
    }
}

/// Process level configuration of the `graphraft` binary
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub group: String,
    pub endpoint: String,
    pub metrics_addr: String,
    pub raft: RaftConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            group: "graph".to_string(),
            endpoint: "127.0.0.1:8281".to_string(),
            metrics_addr: "0.0.0.0:8291".to_string(),
            raft: RaftConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml(path: &str) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file {}, {:?}",
                    path, e
                );
                return Ok(RuntimeConfig::default());
            }
        };
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Configuration(e.to_string()))
    }
}
