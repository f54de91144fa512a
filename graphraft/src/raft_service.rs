//! Raft service implementation
//!
//! Receives the raft message stream of each peer and feeds the local node.

use std::sync::Arc;

use protobuf::Message;
use raft::prelude::Message as RaftMessage;

use crate::context::ClusterContext;
use crate::pb::raft_service_server::RaftService;
use crate::pb::{PostDataRequest, PostDataResponse, ResultCode};

pub struct RaftServiceSVC {
    context: Arc<ClusterContext>,
}

impl RaftServiceSVC {
    pub fn new(context: Arc<ClusterContext>) -> Self {
        RaftServiceSVC { context }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn post_data(
        &self,
        request: tonic::Request<tonic::Streaming<PostDataRequest>>,
    ) -> Result<tonic::Response<PostDataResponse>, tonic::Status> {
        let mut stream = request.into_inner();
        // the stream lives as long as the peer connection, only the last
        // outcome is reported back
        let mut code = ResultCode::Ok;
        while let Some(request) = stream.message().await? {
            match RaftMessage::parse_from_bytes(request.data.as_slice()) {
                Ok(message) => {
                    if let Err(e) = self.context.step(message) {
                        log::warn!("raft step error: {}", e);
                        code = ResultCode::from(&e);
                    }
                }
                Err(e) => {
                    log::warn!("raft parse error: {}", e);
                    code = ResultCode::Fail;
                }
            }
        }
        let mut response = PostDataResponse::default();
        response.push_ret(code);
        Ok(tonic::Response::new(response))
    }
}
