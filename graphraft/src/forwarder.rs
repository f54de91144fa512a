use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::command::StoreType;
use crate::config::Peer;
use crate::error::{Error, Phase, Result};
use crate::metrics;
use crate::transport::Transport;

/// Ships writes that land on a follower to the leader. Reads are never
/// forwarded.
pub struct LeaderForwarder {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl LeaderForwarder {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        LeaderForwarder { transport, timeout }
    }

    /// Returns the index the leader applied the batch at. A `NotLeader`
    /// answer means `leader` was stale.
    pub async fn forward(&self, leader: &Peer, store: StoreType, batch: Vec<u8>) -> Result<u64> {
        metrics::record_metrics("forward", || async {
            log::debug!("Forward {} batch to leader {}", store, leader);
            match time::timeout(self.timeout, self.transport.forward(leader, store, batch)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(Phase::Forward)),
            }
        })
        .await
    }
}
