//! tests/common/harness.rs
//!
//! A test harness for creating and managing clusters of real nodes. It
//! abstracts away the boilerplate of:
//! - Building per-node configuration on ephemeral loopback ports.
//! - Starting nodes and tearing them down.
//! - Polling for replicated state with a deadline.

use anyhow::{Context, Result};
use repram::{App, AppHandle, Config};
use std::time::Duration;

/// A handle to a running node instance in a test environment.
pub struct TestNode {
    pub config: Config,
    pub handle: AppHandle,
}

impl TestNode {
    /// Starts a node in the given enclave, bootstrapping through `seeds`.
    pub async fn spawn(seeds: Vec<String>, enclave: &str) -> Result<Self> {
        Self::spawn_with(seeds, enclave, |_| {}).await
    }

    /// Like `spawn`, with a hook to adjust the configuration first.
    pub async fn spawn_with<F>(seeds: Vec<String>, enclave: &str, adjust: F) -> Result<Self>
    where
        F: FnOnce(&mut Config),
    {
        let mut config = Config {
            node_id: String::new(), // generated
            address: "127.0.0.1".to_string(),
            gossip_port: 0, // ephemeral
            http_port: 0,
            enclave: enclave.to_string(),
            replication_factor: 3,
            max_store_bytes: 0,
            write_timeout_ms: 2_000,
            cluster_secret: String::new(),
            min_ttl_secs: 1,
            max_ttl_secs: 3_600,
            // Health checks are effectively off by default so that tests
            // exercising other behavior never race peer eviction.
            health_interval_ms: 60_000,
            topology_interval_ms: 500,
            sweep_interval_ms: 200,
            bootstrap_seeds: seeds,
        };
        adjust(&mut config);

        let handle = App::new(config.clone())
            .context("Failed to create app")?
            .start()
            .await
            .context("Failed to start node")?;
        tracing::info!(gossip = %handle.gossip_addr, enclave, "Spawned test node");
        Ok(Self { config, handle })
    }

    /// The `host:port` string other nodes can use as a bootstrap seed.
    pub fn seed_addr(&self) -> String {
        format!("127.0.0.1:{}", self.handle.gossip_addr.port())
    }

    pub fn node_id(&self) -> String {
        self.handle.gossip.node_id().to_string()
    }

    /// Stops the node without waiting; its ports go dark.
    pub fn kill(&self) {
        self.handle.trigger_shutdown();
    }

    /// Shuts the node down gracefully.
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

/// Polls `condition` every 25 ms until it holds or the deadline passes.
pub async fn wait_until<F>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

/// Waits until every node in the slice knows `expected` peers.
pub async fn wait_for_discovery(nodes: &[&TestNode], expected: usize, deadline: Duration) -> bool {
    wait_until(deadline, || {
        nodes
            .iter()
            .all(|node| node.handle.gossip.peer_count() >= expected)
    })
    .await
}
