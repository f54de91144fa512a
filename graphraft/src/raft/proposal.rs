#![allow(clippy::field_reassign_with_default)]

use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use raft::prelude::*;

use crate::error::{Error, Result};

/// A request handed to the raft loop
pub enum Proposal {
    /// Entry data, answered with the log index it was appended at
    Normal {
        data: Vec<u8>,
        accepted: Sender<Result<u64>>,
    },
    /// Membership change, answered once the change is applied
    ConfChange {
        cc: ConfChange,
        applied: Sender<Result<()>>,
    },
    TransferLeader {
        transferee: u64,
        done: Sender<Result<()>>,
    },
    /// Answered with the read index once the local apply cursor reached it
    ReadIndex { ready: Sender<Result<u64>> },
}

impl Proposal {
    pub fn normal(data: Vec<u8>) -> (Self, Receiver<Result<u64>>) {
        let (tx, rx) = oneshot::channel();
        (Proposal::Normal { data, accepted: tx }, rx)
    }

    pub fn conf_change(cc: &ConfChange) -> (Self, Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal::ConfChange {
            cc: cc.clone(),
            applied: tx,
        };
        (proposal, rx)
    }

    pub fn transfer_leader(transferee: u64) -> (Self, Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal::TransferLeader {
            transferee,
            done: tx,
        };
        (proposal, rx)
    }

    pub fn read_index() -> (Self, Receiver<Result<u64>>) {
        let (tx, rx) = oneshot::channel();
        (Proposal::ReadIndex { ready: tx }, rx)
    }

    pub fn reject(self, error: Error) {
        match self {
            Proposal::Normal { accepted, .. } => {
                let _ = accepted.send(Err(error));
            }
            Proposal::ConfChange { applied, .. } => {
                let _ = applied.send(Err(error));
            }
            Proposal::TransferLeader { done, .. } => {
                let _ = done.send(Err(error));
            }
            Proposal::ReadIndex { ready } => {
                let _ = ready.send(Err(error));
            }
        }
    }
}

/// Builds an add-node change carrying the new peer's address
pub fn add_node(id: u64, addr: &str) -> ConfChange {
    let mut cc = ConfChange::default();
    cc.node_id = id;
    cc.set_change_type(ConfChangeType::AddNode);
    cc.context = addr.as_bytes().to_vec().into();
    cc
}

pub fn remove_node(id: u64) -> ConfChange {
    let mut cc = ConfChange::default();
    cc.node_id = id;
    cc.set_change_type(ConfChangeType::RemoveNode);
    cc
}
