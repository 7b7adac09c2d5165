//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level struct holding all application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Stable identifier for this node. An empty string means a random
    /// `node-<hex>` id is generated at startup.
    pub node_id: String,
    /// Host this node binds to and advertises to its peers.
    pub address: String,
    /// UDP port for node-to-node gossip. Zero picks an ephemeral port.
    pub gossip_port: u16,
    /// Port the HTTP collaborator advertises; carried in topology messages
    /// but never bound by the core.
    pub http_port: u16,
    /// Replication boundary. Data-bearing writes only replicate among peers
    /// with a matching enclave; membership gossip crosses enclaves.
    pub enclave: String,
    pub replication_factor: u32,
    /// Byte capacity of the store (sum of key + value lengths). Zero means
    /// unlimited.
    pub max_store_bytes: u64,
    pub write_timeout_ms: u64,
    /// Shared secret for wire authentication. Empty means open mode.
    pub cluster_secret: String,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub health_interval_ms: u64,
    pub topology_interval_ms: u64,
    pub sweep_interval_ms: u64,
    /// `host:port` gossip addresses of seed nodes to join through.
    pub bootstrap_seeds: Vec<String>,
}

impl Config {
    /// Loads configuration from `repram.toml` and environment variables.
    /// It uses the `Default` implementation as a base layer.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("repram.toml"))
            .merge(Env::prefixed("REPRAM_"))
            .extract()
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn min_ttl(&self) -> Duration {
        Duration::from_secs(self.min_ttl_secs)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn topology_interval(&self) -> Duration {
        Duration::from_millis(self.topology_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            address: "127.0.0.1".to_string(),
            gossip_port: 7080,
            http_port: 8080,
            enclave: "default".to_string(),
            replication_factor: 3,
            max_store_bytes: 0,
            write_timeout_ms: 5_000,
            cluster_secret: String::new(),
            min_ttl_secs: 60,
            max_ttl_secs: 86_400,
            health_interval_ms: 30_000,
            topology_interval_ms: 30_000,
            sweep_interval_ms: 5_000,
            bootstrap_seeds: Vec::new(),
        }
    }
}
