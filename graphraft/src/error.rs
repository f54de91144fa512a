//! Error taxonomy of the replication layer
//!
//! Startup problems (`Configuration`, `Startup`) abort initialization. Per-write
//! problems are returned to the caller of `apply()` and carry enough detail for
//! the caller to decide whether to retry (`NotLeader`, `Busy`), treat the
//! outcome as unknown (`Timeout`) or give up (`Apply`, `ConsensusFatal`).

use std::fmt;

use thiserror::Error;

use crate::config::Peer;

/// The wait that ran out of time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No leader became known
    Election,
    /// The local log did not catch up with the leader's commit index
    LogSync,
    /// A proposal was not committed and applied
    Commit,
    /// A forwarded request did not come back from the leader
    Forward,
    /// A read index was not confirmed and applied
    ReadIndex,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Phase::Election => "leader election",
            Phase::LogSync => "raft log sync",
            Phase::Commit => "commit",
            Phase::Forward => "forwarded request",
            Phase::ReadIndex => "read index",
        };
        f.write_str(phase)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid raft configuration: {0}")]
    Configuration(String),

    #[error("failed to start raft node: {0}")]
    Startup(String),

    #[error(
        "this node is not the leader, current leader is {}",
        leader.as_ref().map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string())
    )]
    NotLeader { leader: Option<Peer> },

    #[error("raft log is busy, please retry later")]
    Busy,

    #[error("timed out waiting for {0}, the outcome is unknown")]
    Timeout(Phase),

    #[error("failed to apply command: {0}")]
    Apply(String),

    #[error("raft node stopped participating in the group: {0}")]
    ConsensusFatal(String),

    #[error("raft node is stopped")]
    Stopped,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Errors the caller may retry after refreshing leader knowledge or
    /// backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotLeader { .. } | Error::Busy)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Apply(format!("codec error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_leader_message() {
        let err = Error::NotLeader { leader: None };
        assert_eq!(
            err.to_string(),
            "this node is not the leader, current leader is unknown"
        );

        let err = Error::NotLeader {
            leader: Some(Peer::new(2, "127.0.0.1:8282")),
        };
        assert!(err.to_string().ends_with("2@127.0.0.1:8282"));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Busy.is_retryable());
        assert!(Error::NotLeader { leader: None }.is_retryable());
        assert!(!Error::Timeout(Phase::Commit).is_retryable());
        assert!(!Error::Apply("bad payload".into()).is_retryable());
    }
}
