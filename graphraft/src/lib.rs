//! Raft based replication for the stores of a graph database
//!
//! Each graph owns one consensus group. Writes to its schema, graph and
//! system stores are proposed to the group leader, replicated and applied on
//! every node; reads are served from the local copy, optionally after a read
//! index confirmed it is current.

/// Protocol buffer definitions shared by the RPC services
#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("graphraft");
}

pub mod cache;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod forwarder;
pub mod metrics;
pub mod pending;
pub mod pool;
pub mod raft;
pub mod raft_client;
pub mod raft_service;
pub mod raft_store;
pub mod server;
pub mod state_machine;
pub mod store;
pub mod store_service;
pub mod transport;

#[cfg(test)]
mod cluster_tests;

pub use context::ClusterContext;
pub use error::{Error, Phase, Result};
pub use raft_store::ReplicatedStore;
