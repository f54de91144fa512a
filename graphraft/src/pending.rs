//! In-flight writes waiting for their log entry to be applied

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Error, Result};

// undecodable entries nobody waited for yet
const MAX_UNCLAIMED_FAILURES: usize = 64;

struct Waiter {
    tx: oneshot::Sender<Result<u64>>,
    index: Option<u64>,
}

#[derive(Default)]
struct Waiters {
    by_id: HashMap<Uuid, Waiter>,
    by_index: HashMap<u64, Uuid>,
    unclaimed: BTreeMap<u64, String>,
}

impl Waiters {
    fn take(&mut self, request_id: &Uuid) -> Option<oneshot::Sender<Result<u64>>> {
        let waiter = self.by_id.remove(request_id)?;
        if let Some(index) = waiter.index {
            self.by_index.remove(&index);
        }
        Some(waiter.tx)
    }
}

/// Completion signals keyed by the correlation id carried in each
/// `StoreCommand`. An entry lives from proposal until the command is applied
/// or its caller gives up waiting.
///
/// Once proposed, a waiter is also bound to its log index so that an entry
/// which can't be decoded, and therefore yields no correlation id, still
/// fails its caller.
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<Waiters>,
}

impl PendingRequests {
    pub fn new() -> Self {
        PendingRequests::default()
    }

    pub fn register(&self, request_id: Uuid) -> oneshot::Receiver<Result<u64>> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .by_id
            .insert(request_id, Waiter { tx, index: None });
        rx
    }

    /// Records the log index `request_id` was proposed at
    pub fn bind(&self, request_id: &Uuid, index: u64) {
        let mut guard = self.waiters.lock().unwrap();
        let waiters = &mut *guard;
        if let Some(reason) = waiters.unclaimed.remove(&index) {
            if let Some(tx) = waiters.take(request_id) {
                let _ = tx.send(Err(undecodable(index, &reason)));
            }
            return;
        }
        if let Some(waiter) = waiters.by_id.get_mut(request_id) {
            waiter.index = Some(index);
            waiters.by_index.insert(index, *request_id);
        }
    }

    /// Completes a request. Unknown ids belong to other nodes or to callers
    /// that already gave up, and are ignored.
    pub fn resolve(&self, request_id: &Uuid, result: Result<u64>) -> bool {
        let waiter = self.waiters.lock().unwrap().take(request_id);
        match waiter {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Fails whoever proposed the entry at `index`, which could not be
    /// decoded. The proposer may not have bound the index yet, in which case
    /// the failure is kept for it.
    pub fn fail_entry(&self, index: u64, reason: &str) {
        let mut waiters = self.waiters.lock().unwrap();
        let request_id = waiters.by_index.get(&index).copied();
        match request_id.and_then(|id| waiters.take(&id)) {
            Some(tx) => {
                let _ = tx.send(Err(undecodable(index, reason)));
            }
            None => {
                waiters.unclaimed.insert(index, reason.to_string());
                while waiters.unclaimed.len() > MAX_UNCLAIMED_FAILURES {
                    let oldest = waiters.unclaimed.keys().next().copied();
                    if let Some(oldest) = oldest {
                        waiters.unclaimed.remove(&oldest);
                    }
                }
            }
        }
    }

    pub fn abandon(&self, request_id: &Uuid) {
        self.waiters.lock().unwrap().take(request_id);
    }

    /// Abandons `request_id` once the returned guard is dropped, including
    /// when the waiting future is cancelled
    pub fn guard(&self, request_id: Uuid) -> WaiterGuard<'_> {
        WaiterGuard {
            pending: self,
            request_id,
        }
    }

    /// Fails every waiter, used when the node stops
    pub fn close(&self) {
        let waiters: Vec<_> = {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.by_index.clear();
            waiters.by_id.drain().collect()
        };
        for (_, waiter) in waiters {
            let _ = waiter.tx.send(Err(Error::Stopped));
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn undecodable(index: u64, reason: &str) -> Error {
    Error::Apply(format!("log entry {} can't be decoded: {}", index, reason))
}

pub struct WaiterGuard<'a> {
    pending: &'a PendingRequests,
    request_id: Uuid,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.pending.abandon(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_once() {
        let pending = PendingRequests::new();
        let id = Uuid::new_v4();
        let rx = pending.register(id);
        assert!(pending.resolve(&id, Ok(7)));
        assert!(!pending.resolve(&id, Ok(8)));
        assert_eq!(rx.await.unwrap().unwrap(), 7);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_abandon() {
        let pending = PendingRequests::new();
        let id = Uuid::new_v4();
        let rx = pending.register(id);
        pending.abandon(&id);
        assert!(!pending.resolve(&id, Err(Error::Busy)));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_guard_releases_cancelled_waiter() {
        let pending = PendingRequests::new();
        let id = Uuid::new_v4();
        let waiting = async {
            let rx = pending.register(id);
            let _guard = pending.guard(id);
            rx.await
        };
        // the caller gives up before the entry is applied
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), waiting).await;
        assert!(result.is_err());
        assert!(pending.is_empty());
        assert!(!pending.resolve(&id, Ok(3)));
    }

    #[tokio::test]
    async fn test_undecodable_entry_fails_proposer() {
        let pending = PendingRequests::new();

        // applied after the proposer learned its index
        let id = Uuid::new_v4();
        let rx = pending.register(id);
        pending.bind(&id, 4);
        pending.fail_entry(4, "bad header");
        assert!(matches!(rx.await.unwrap(), Err(Error::Apply(_))));

        // applied before the proposer learned its index
        let id = Uuid::new_v4();
        let rx = pending.register(id);
        pending.fail_entry(5, "bad header");
        pending.bind(&id, 5);
        assert!(matches!(rx.await.unwrap(), Err(Error::Apply(_))));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unclaimed_failures_are_bounded() {
        let pending = PendingRequests::new();
        for index in 0..(MAX_UNCLAIMED_FAILURES as u64 * 2) {
            pending.fail_entry(index, "bad header");
        }
        let waiters = pending.waiters.lock().unwrap();
        assert_eq!(waiters.unclaimed.len(), MAX_UNCLAIMED_FAILURES);
        assert!(!waiters.unclaimed.contains_key(&0));
    }

    #[tokio::test]
    async fn test_resolve_clears_index() {
        let pending = PendingRequests::new();
        let id = Uuid::new_v4();
        let rx = pending.register(id);
        pending.bind(&id, 9);
        assert!(pending.resolve(&id, Ok(9)));
        assert_eq!(rx.await.unwrap().unwrap(), 9);
        assert!(pending.waiters.lock().unwrap().by_index.is_empty());
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let pending = PendingRequests::new();
        let rx = pending.register(Uuid::new_v4());
        pending.close();
        assert!(matches!(rx.await.unwrap(), Err(Error::Stopped)));
        assert!(pending.is_empty());
    }
}
