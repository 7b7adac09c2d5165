//! src/app.rs
//!
//! Defines the main `App` struct, which wires the store, transport, gossip,
//! and cluster node together and manages the lifecycle of all concurrent
//! services.

use crate::{
    bootstrap,
    config::Config,
    error::{Error, Result},
    gossip::GossipProtocol,
    node::ClusterNode,
    store::Store,
    transport::{Inbound, Transport},
    wire::{NodeInfo, WireMac},
};
use rand::RngCore;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Encapsulates the entire application, including its configuration and the
/// lifecycle management of its concurrent services.
pub struct App {
    config: Config,
}

/// A running node: the live service handles plus the means to stop them.
pub struct AppHandle {
    pub node: Arc<ClusterNode>,
    pub gossip: Arc<GossipProtocol>,
    /// The actual bound gossip address (relevant when the configured port
    /// was zero).
    pub gossip_addr: SocketAddr,
    shutdown_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Creates a new `App` from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self { config })
    }

    /// Brings the node up:
    ///   1. Binds the transport and learns the effective gossip address.
    ///   2. Builds the store, gossip protocol, and cluster node.
    ///   3. Spawns every service task under one cancellation token.
    ///   4. Joins the cluster through the configured seeds.
    pub async fn start(self) -> Result<AppHandle> {
        let config = self.config;
        let node_id = if config.node_id.is_empty() {
            generated_node_id()
        } else {
            config.node_id.clone()
        };
        let enclave = if config.enclave.is_empty() {
            crate::wire::default_enclave()
        } else {
            config.enclave.clone()
        };

        let shutdown_token = CancellationToken::new();
        let mac = WireMac::new(&config.cluster_secret);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(256);

        let bind_addr = resolve_bind_addr(&config.address, config.gossip_port)?;
        let transport = Transport::bind(bind_addr, mac, inbound_tx, shutdown_token.clone())?;
        let gossip_addr = transport.local_addr()?;
        let handle = transport.handle();

        let local = NodeInfo {
            id: node_id,
            address: config.address.clone(),
            port: gossip_addr.port(),
            http_port: config.http_port,
            enclave,
        };
        tracing::info!(
            node_id = %local.id,
            gossip_addr = %gossip_addr,
            enclave = %local.enclave,
            "🚀 Starting node..."
        );

        let gossip = Arc::new(GossipProtocol::new(
            local,
            config.replication_factor,
            config.health_interval(),
            config.topology_interval(),
            handle.clone(),
        ));
        let store = Arc::new(Store::new(config.max_store_bytes));
        let node = Arc::new(ClusterNode::new(store.clone(), gossip.clone(), &config));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(transport.run()));
        tasks.push(tokio::spawn(
            store.run_sweeper(config.sweep_interval(), shutdown_token.clone()),
        ));
        tasks.push(tokio::spawn(
            gossip.clone().run_health(shutdown_token.clone()),
        ));
        tasks.push(tokio::spawn(
            gossip.clone().run_topology(shutdown_token.clone()),
        ));
        tasks.push(tokio::spawn(
            node.clone().run(inbound_rx, shutdown_token.clone()),
        ));

        // One-shot join; all seeds failing just means a singleton start.
        bootstrap::join(&config.bootstrap_seeds, &handle, &gossip).await;

        Ok(AppHandle {
            node,
            gossip,
            gossip_addr,
            shutdown_token,
            tasks,
        })
    }
}

impl AppHandle {
    /// Requests shutdown without waiting for the services to finish.
    pub fn trigger_shutdown(&self) {
        self.shutdown_token.cancel();
    }

    /// Gracefully terminates all service tasks.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = ?e, "Service task failed");
            }
        }
        tracing::info!("👋 Node has shut down gracefully.");
    }
}

fn generated_node_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("node-{}", hex::encode(bytes))
}

fn resolve_bind_addr(address: &str, port: u16) -> Result<SocketAddr> {
    (address, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::AddrResolve(format!("{address}:{port}")))
}
