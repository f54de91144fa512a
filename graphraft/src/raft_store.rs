//! Replicated store
//!
//! Wraps one local store so that writes go through the raft log and reads
//! can optionally be linearized through a read index.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};

use crate::command::{MutationBatch, StoreType};
use crate::context::ClusterContext;
use crate::error::{Error, Phase, Result};
use crate::metrics;
use crate::store::BackendStore;

pub struct ReplicatedStore {
    store_type: StoreType,
    backend: Arc<dyn BackendStore>,
    context: Arc<ClusterContext>,
}

impl ReplicatedStore {
    pub(crate) fn new(
        store_type: StoreType,
        backend: Arc<dyn BackendStore>,
        context: Arc<ClusterContext>,
    ) -> Self {
        ReplicatedStore {
            store_type,
            backend,
            context,
        }
    }

    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    /// Replicates `batch` and returns once it is applied on this node.
    ///
    /// A full proposal queue is retried after a random pause. The whole call,
    /// retries included, never outlasts the apply timeout.
    pub async fn apply(&self, batch: &MutationBatch) -> Result<u64> {
        let data = batch.encode()?;
        metrics::record_metrics("apply", || self.apply_with_retry(data)).await
    }

    async fn apply_with_retry(&self, data: Vec<u8>) -> Result<u64> {
        let config = self.context.config();
        let deadline = Instant::now() + config.apply_timeout();
        let (min_sleep, max_sleep) = config.busy_sleep_range();
        loop {
            let phase = if self.context.is_leader() {
                Phase::Commit
            } else {
                Phase::Forward
            };
            let result = match time::timeout_at(deadline, self.apply_once(data.clone())).await {
                Ok(result) => result,
                Err(_) => {
                    log::warn!(
                        "Writing {} batch did not finish within {:?}",
                        self.store_type,
                        config.apply_timeout()
                    );
                    return Err(Error::Timeout(phase));
                }
            };
            match result {
                Err(Error::Busy) => {
                    let pause = jitter(min_sleep, max_sleep);
                    if Instant::now() + pause >= deadline {
                        log::warn!("Give up writing {} batch, raft log stays busy", self.store_type);
                        return Err(Error::Busy);
                    }
                    log::info!(
                        "Raft log is busy, retry {} batch in {:?}",
                        self.store_type,
                        pause
                    );
                    time::sleep(pause).await;
                }
                result => return result,
            }
        }
    }

    /// One write attempt. A stale leader answer is retried once.
    async fn apply_once(&self, data: Vec<u8>) -> Result<u64> {
        let mut retried = false;
        loop {
            let result = if self.context.is_leader() {
                self.context
                    .propose_and_wait(self.store_type, data.clone(), false)
                    .await
            } else if self.context.config().forward_writes {
                self.context
                    .forward_to_leader(self.store_type, data.clone())
                    .await
            } else {
                return Err(Error::NotLeader {
                    leader: self.context.leader(),
                });
            };
            match result {
                Err(Error::NotLeader { leader }) if !retried => {
                    log::debug!(
                        "Leader moved while writing {} batch, last known {:?}",
                        self.store_type,
                        leader
                    );
                    retried = true;
                }
                result => return result,
            }
        }
    }

    /// Reads the local store without any consistency check
    pub fn read<R>(&self, f: impl FnOnce(&dyn BackendStore) -> R) -> R {
        f(self.backend.as_ref())
    }

    /// Reads the local store once it reflects every write committed before
    /// the call. Falls back to [`read`](Self::read) when safe reads are off.
    pub async fn safe_read<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&dyn BackendStore) -> R + Send + 'static,
        R: Send + 'static,
    {
        if !self.context.config().safe_read {
            return Ok(self.read(f));
        }
        metrics::record_metrics("safe_read", || async {
            let node = self.context.node()?;
            let pool = self.context.read_index_pool()?;
            let backend = self.backend.clone();
            let timeout = self.context.config().rpc_timeout();
            let runtime = tokio::runtime::Handle::current();

            let (tx, rx) = oneshot::channel();
            pool.execute(move || {
                let confirmed = runtime.block_on(async {
                    time::timeout(timeout, node.read_index())
                        .await
                        .unwrap_or(Err(Error::Timeout(Phase::ReadIndex)))
                });
                let _ = tx.send(confirmed.map(|_| f(backend.as_ref())));
            })?;
            rx.await.map_err(|_| Error::Stopped)?
        })
        .await
    }
}

/// Random pause in `[min, max]`
fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}
