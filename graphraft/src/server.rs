//! Node process
//!
//! Wires one consensus group with its three in-memory stores, the gRPC
//! services and the metrics endpoint.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::command::StoreType;
use crate::config::RuntimeConfig;
use crate::context::ClusterContext;
use crate::error::{Error, Result};
use crate::metrics;
use crate::pb::raft_service_server::RaftServiceServer;
use crate::pb::store_service_server::StoreServiceServer;
use crate::raft_client::GrpcTransport;
use crate::raft_service::RaftServiceSVC;
use crate::raft_store::ReplicatedStore;
use crate::store::MemoryStore;
use crate::store_service::StoreServiceSVC;

pub struct Server {
    config: RuntimeConfig,
    context: Arc<ClusterContext>,
    stores: BTreeMap<StoreType, Arc<ReplicatedStore>>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let context = ClusterContext::new(&config.group, config.raft.clone())?;
        let stores = StoreType::ALL
            .iter()
            .map(|&store_type| {
                let backend = Arc::new(MemoryStore::new(store_type.to_string()));
                (store_type, context.register(store_type, backend))
            })
            .collect();
        let (stop, _) = watch::channel(false);
        Ok(Server {
            config,
            context,
            stores,
            stop,
            tasks: Vec::new(),
        })
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    pub fn store(&self, store_type: StoreType) -> Option<&Arc<ReplicatedStore>> {
        self.stores.get(&store_type)
    }

    /// Serves the RPC endpoints, starts the raft node and waits until it
    /// joined the group
    pub async fn start(&mut self) -> Result<()> {
        metrics::init_registry();
        self.start_grpc_server()?;
        self.start_metrics_server()?;

        let wait_leader = self.config.raft.wait_leader_timeout();
        let wait_log_sync = self.config.raft.wait_log_sync_timeout();
        let transport = Arc::new(GrpcTransport::new(self.config.raft.rpc_connect_timeout()));
        self.context.start(&self.config.endpoint, transport).await?;
        self.start_cache_listener();
        self.context.await_ready(wait_leader, wait_log_sync).await?;
        log::info!(
            "graphraft node {} ready, leader is {:?}",
            self.config.endpoint,
            self.context.leader()
        );
        Ok(())
    }

    pub async fn stop(&mut self) {
        log::info!("server stop");
        let _ = self.stop.send(true);
        self.context.shutdown().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    fn start_grpc_server(&mut self) -> Result<()> {
        let addr = listen_addr(&self.config.endpoint)?;
        let mut stop = self.stop.subscribe();
        let grpc_server = tonic::transport::Server::builder()
            .add_service(RaftServiceServer::new(RaftServiceSVC::new(
                self.context.clone(),
            )))
            .add_service(StoreServiceServer::new(StoreServiceSVC::new(
                self.context.clone(),
            )))
            .serve_with_shutdown(addr, async move {
                let _ = stop.changed().await;
            });
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = grpc_server.await {
                log::error!("grpc server failed: {}", e);
            }
        }));
        log::info!("grpc server started on {}", addr);
        Ok(())
    }

    fn start_metrics_server(&mut self) -> Result<()> {
        let addr: SocketAddr = self.config.metrics_addr.parse().map_err(|e| {
            Error::Configuration(format!(
                "invalid metrics address {}: {}",
                self.config.metrics_addr, e
            ))
        })?;
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                            log::error!("failed to encode metrics: {}", e);
                        }
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        let server = hyper::Server::try_bind(&addr)
            .map_err(|e| Error::Startup(format!("failed to bind metrics server on {}: {}", addr, e)))?
            .serve(make_svc);
        let mut stop = self.stop.subscribe();
        let server = server.with_graceful_shutdown(async move {
            let _ = stop.changed().await;
        });
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server failed: {}", e);
            }
        }));
        log::info!("metrics server started on {}", addr);
        Ok(())
    }

    /// Drains cache invalidations. The graph engine cache is not part of this
    /// process, so they are only logged.
    fn start_cache_listener(&mut self) {
        let mut events = match self.context.take_cache_events() {
            Some(events) => events,
            None => return,
        };
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log::debug!(
                    "cache invalidation on {} store: {:?} {:?}",
                    event.store,
                    event.entity,
                    event.action
                );
            }
        }));
    }
}

/// Address the gRPC server binds for `endpoint`. Host names bind every
/// interface on the endpoint port.
fn listen_addr(endpoint: &str) -> Result<SocketAddr> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }
    endpoint
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
        .ok_or_else(|| Error::Configuration(format!("invalid endpoint {}", endpoint)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr() {
        assert_eq!(
            listen_addr("127.0.0.1:8281").unwrap(),
            "127.0.0.1:8281".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            listen_addr("graph-node-2:8282").unwrap(),
            "0.0.0.0:8282".parse::<SocketAddr>().unwrap()
        );
        assert!(listen_addr("graph-node-2").is_err());
    }

    #[test]
    fn test_server_registers_every_store() {
        let mut config = RuntimeConfig::default();
        config.raft.group_peers = "127.0.0.1:8281".to_string();
        let server = Server::new(config).unwrap();
        for store_type in StoreType::ALL {
            assert_eq!(server.store(store_type).unwrap().store_type(), store_type);
        }
    }
}
