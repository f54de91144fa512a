use raft::StateRole;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

pub mod node;
pub mod proposal;
mod segment;
pub mod storage;

pub use node::{Node, NodeHandle};
pub use storage::{FileStorage, RaftPaths};

/// Callbacks driven by the raft loop.
///
/// `on_apply` runs on the loop itself, in log order. Snapshot work is handed
/// back as a receiver so the implementation can run it elsewhere; the loop
/// waits for it before applying anything else.
pub trait StateMachine: Send + 'static {
    fn on_apply(&mut self, index: u64, data: &[u8]);

    fn on_leader_start(&mut self, term: u64);

    fn on_leader_stop(&mut self);

    fn on_snapshot_save(&mut self) -> oneshot::Receiver<Result<Vec<u8>>>;

    fn on_snapshot_load(
        &mut self,
        index: u64,
        term: u64,
        data: Vec<u8>,
    ) -> oneshot::Receiver<Result<()>>;

    /// The node stops participating in the group after this call
    fn on_error(&mut self, error: &Error);

    fn last_applied(&self) -> u64;
}

/// What a node last reported about itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeStatus {
    pub id: u64,
    pub role: StateRole,
    pub leader_id: u64,
    pub term: u64,
    pub commit: u64,
    pub applied: u64,
    pub fatal: Option<String>,
}

impl NodeStatus {
    pub fn is_leader(&self) -> bool {
        self.role == StateRole::Leader && self.fatal.is_none()
    }
}
