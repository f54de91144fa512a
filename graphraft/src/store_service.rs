//! Store service implementation
//!
//! Exposes the command surface of a node: forwarded writes from followers
//! plus the membership administration calls.

use std::sync::Arc;

use crate::cache::Role;
use crate::command::StoreType;
use crate::config::Peer;
use crate::context::ClusterContext;
use crate::error::{Error, Phase, Result};
use crate::metrics;
use crate::pb::store_service_server::StoreService;
use crate::pb::{
    AddPeerRequest, AdminResponse, ListPeersRequest, ListPeersResponse, PeerInfo, PeerRole,
    RemovePeerRequest, ResultCode, SubmitCommandRequest, SubmitCommandResponse,
    TransferLeadershipRequest,
};

impl From<&Error> for ResultCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::NotLeader { .. } => ResultCode::NotLeader,
            Error::Busy => ResultCode::Busy,
            Error::Timeout(_) => ResultCode::Timeout,
            Error::Apply(_) => ResultCode::ApplyFailed,
            Error::ConsensusFatal(_) => ResultCode::Fatal,
            Error::Stopped => ResultCode::Stopped,
            Error::Configuration(_) | Error::Startup(_) => ResultCode::Fail,
        }
    }
}

impl From<Role> for PeerRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Leader => PeerRole::Leader,
            Role::Candidate => PeerRole::Candidate,
            Role::Follower => PeerRole::Follower,
        }
    }
}

/// Rebuilds the error a remote node answered with
pub(crate) fn remote_error(code: ResultCode, message: String, leader: &str) -> Error {
    match code {
        ResultCode::NotLeader => Error::NotLeader {
            leader: leader.parse::<Peer>().ok(),
        },
        ResultCode::Busy => Error::Busy,
        // the remote phase is not carried, the outcome is unknown either way
        ResultCode::Timeout => Error::Timeout(Phase::Commit),
        ResultCode::Fatal => Error::ConsensusFatal(message),
        ResultCode::Stopped => Error::Stopped,
        ResultCode::Ok | ResultCode::ApplyFailed | ResultCode::Fail => Error::Apply(message),
    }
}

fn leader_of(e: &Error) -> String {
    match e {
        Error::NotLeader {
            leader: Some(leader),
        } => leader.to_string(),
        _ => String::new(),
    }
}

pub struct StoreServiceSVC {
    context: Arc<ClusterContext>,
}

impl StoreServiceSVC {
    pub fn new(context: Arc<ClusterContext>) -> Self {
        StoreServiceSVC { context }
    }

    fn admin_response(&self, result: Result<()>) -> AdminResponse {
        let mut response = AdminResponse {
            leader: self
                .context
                .leader()
                .map(|leader| leader.to_string())
                .unwrap_or_default(),
            ..Default::default()
        };
        match result {
            Ok(()) => response.set_code(ResultCode::Ok),
            Err(e) => {
                response.set_code(ResultCode::from(&e));
                response.message = e.to_string();
            }
        }
        response
    }
}

#[tonic::async_trait]
impl StoreService for StoreServiceSVC {
    /// Accepts a batch forwarded by a follower. Only answers `Ok` once the
    /// batch is applied on this node.
    async fn submit_command(
        &self,
        request: tonic::Request<SubmitCommandRequest>,
    ) -> Result<tonic::Response<SubmitCommandResponse>, tonic::Status> {
        let request = request.into_inner();
        let store = StoreType::from(request.store());
        let result = metrics::record_metrics("submit_command", || {
            self.context.submit_forwarded(store, request.batch)
        })
        .await;

        let mut response = SubmitCommandResponse::default();
        match result {
            Ok(index) => {
                response.set_code(ResultCode::Ok);
                response.applied_index = index;
            }
            Err(e) => {
                log::debug!("Forwarded {} batch failed: {}", store, e);
                response.set_code(ResultCode::from(&e));
                response.message = e.to_string();
                response.leader = leader_of(&e);
            }
        }
        Ok(tonic::Response::new(response))
    }

    async fn transfer_leadership(
        &self,
        request: tonic::Request<TransferLeadershipRequest>,
    ) -> Result<tonic::Response<AdminResponse>, tonic::Status> {
        let endpoint = request.into_inner().endpoint;
        log::info!("transfer leadership to {}", endpoint);
        let result = self.context.transfer_leadership(&endpoint).await;
        Ok(tonic::Response::new(self.admin_response(result)))
    }

    async fn list_peers(
        &self,
        _request: tonic::Request<ListPeersRequest>,
    ) -> Result<tonic::Response<ListPeersResponse>, tonic::Status> {
        let peers = self
            .context
            .list_peers()
            .into_iter()
            .map(|state| {
                let mut info = PeerInfo {
                    id: state.peer.id,
                    endpoint: state.peer.addr,
                    ..Default::default()
                };
                info.set_role(PeerRole::from(state.role));
                info
            })
            .collect();
        Ok(tonic::Response::new(ListPeersResponse { peers }))
    }

    async fn add_peer(
        &self,
        request: tonic::Request<AddPeerRequest>,
    ) -> Result<tonic::Response<AdminResponse>, tonic::Status> {
        let request = request.into_inner();
        log::info!("add peer {}@{}", request.id, request.endpoint);
        let result = if request.id == 0 || request.endpoint.is_empty() {
            Err(Error::Configuration(
                "a peer needs a non zero id and an endpoint".into(),
            ))
        } else {
            self.context
                .add_peer(Peer::new(request.id, request.endpoint))
                .await
        };
        Ok(tonic::Response::new(self.admin_response(result)))
    }

    async fn remove_peer(
        &self,
        request: tonic::Request<RemovePeerRequest>,
    ) -> Result<tonic::Response<AdminResponse>, tonic::Status> {
        let id = request.into_inner().id;
        log::info!("remove peer {}", id);
        let result = self.context.remove_peer(id).await;
        Ok(tonic::Response::new(self.admin_response(result)))
    }
}
