//! Raft client implementation
//!
//! gRPC [`Transport`]: raft messages are streamed to each peer over one
//! long lived `PostData` call, forwarded writes use `SubmitCommand`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use crate::command::StoreType;
use crate::config::Peer;
use crate::error::{Error, Phase, Result};
use crate::pb::raft_service_client::RaftServiceClient;
use crate::pb::store_service_client::StoreServiceClient;
use crate::pb::{self, PostDataRequest, ResultCode, SubmitCommandRequest};
use crate::store_service::remote_error;
use crate::transport::Transport;

const PEER_CHANNEL_SIZE: usize = 1000;

/// Client for a single peer node
struct PeerClient {
    addr: String,
    /// Channel sender feeding the message stream
    sender: Sender<PostDataRequest>,
    /// Set once the stream broke and the client must be rebuilt
    invalid: Arc<AtomicBool>,
    store: StoreServiceClient<Channel>,
}

impl PeerClient {
    /// Creates the peer client and spawns its message stream. The connection
    /// itself is established lazily.
    fn new(addr: &str, connect_timeout: Duration) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(format!("http://{}", addr))?
            .connect_timeout(connect_timeout)
            .connect_lazy();
        let (sender, receiver) = mpsc::channel(PEER_CHANNEL_SIZE);

        let mut raft = RaftServiceClient::new(channel.clone());
        let invalid = Arc::new(AtomicBool::new(false));
        let invalid_clone = invalid.clone();
        let peer = addr.to_string();
        tokio::spawn(async move {
            if let Err(e) = Self::stream_messages(&mut raft, receiver).await {
                log::warn!("Streaming raft messages to {} failed: {}", peer, e);
            }
            invalid_clone.store(true, Ordering::SeqCst);
        });

        Ok(PeerClient {
            addr: addr.to_string(),
            sender,
            invalid,
            store: StoreServiceClient::new(channel),
        })
    }

    async fn stream_messages(
        client: &mut RaftServiceClient<Channel>,
        receiver: Receiver<PostDataRequest>,
    ) -> Result<(), tonic::Status> {
        let stream = tokio_stream::wrappers::ReceiverStream::new(receiver);
        let _ = client.post_data(stream).await?;
        Ok(())
    }

    fn is_usable(&self, peer: &Peer) -> bool {
        !self.invalid.load(Ordering::SeqCst) && self.addr == peer.addr
    }
}

/// Client for managing connections to all peer nodes
pub struct GrpcTransport {
    peers: Mutex<HashMap<u64, PeerClient>>,
    connect_timeout: Duration,
}

impl GrpcTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        GrpcTransport {
            peers: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Runs `f` with a usable client of `peer`, rebuilding it if its stream
    /// broke or the peer moved
    async fn with_client<T>(
        &self,
        peer: &Peer,
        f: impl FnOnce(&PeerClient) -> T,
    ) -> Result<T, tonic::transport::Error> {
        let mut peers = self.peers.lock().await;
        let client = match peers.remove(&peer.id) {
            Some(client) if client.is_usable(peer) => client,
            _ => PeerClient::new(&peer.addr, self.connect_timeout)?,
        };
        let result = f(&client);
        peers.insert(peer.id, client);
        Ok(result)
    }
}

#[tonic::async_trait]
impl Transport for GrpcTransport {
    async fn send(&self, to: &Peer, msg: RaftMessage) {
        let request = match msg.write_to_bytes() {
            Ok(data) => PostDataRequest { data },
            Err(e) => {
                log::error!("Failed to encode raft message to {}: {}", to, e);
                return;
            }
        };
        let sent = self
            .with_client(to, |client| client.sender.try_send(request))
            .await;
        match sent {
            Ok(Ok(())) => {}
            // raft resends what gets lost here
            Ok(Err(e)) => log::debug!("Drop raft message to {}: {}", to, e),
            Err(e) => log::error!("Failed to create peer client for {}: {}", to, e),
        }
    }

    async fn forward(&self, leader: &Peer, store: StoreType, batch: Vec<u8>) -> Result<u64> {
        let mut client = self
            .with_client(leader, |client| client.store.clone())
            .await
            .map_err(|e| {
                log::warn!("Failed to reach leader {}: {}", leader, e);
                Error::Timeout(Phase::Forward)
            })?;
        let mut request = SubmitCommandRequest {
            batch,
            ..Default::default()
        };
        request.set_store(pb::StoreKind::from(store));

        let response = client
            .submit_command(request)
            .await
            .map_err(|status| {
                log::warn!("Forwarding to leader {} failed: {}", leader, status);
                Error::Timeout(Phase::Forward)
            })?
            .into_inner();
        match response.code() {
            ResultCode::Ok => Ok(response.applied_index),
            code => Err(remote_error(code, response.message, &response.leader)),
        }
    }

    async fn close(&self) {
        // dropping the senders ends the message streams
        self.peers.lock().await.clear();
    }
}
