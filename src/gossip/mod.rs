//! src/gossip/mod.rs
//!
//! The gossip/peer-membership layer. `GossipProtocol` owns the peer
//! registry with its failure counts, the seen-message cache used for
//! duplicate suppression, and the periodic health-check and topology-sync
//! loops. Dissemination goes out through the transport handle; inbound
//! membership messages are delegated here by the cluster node.

use crate::{
    error::{Error, Result},
    transport::TransportHandle,
    wire::{Message, MessageIds, NodeInfo},
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub mod fanout;

pub use fanout::FANOUT_THRESHOLD;

/// Consecutive failed sends after which a peer is evicted from the registry.
pub const MAX_PING_FAILURES: u32 = 3;
/// Number of recently observed message ids retained for duplicate
/// suppression, evicted FIFO.
pub const SEEN_CACHE_CAPACITY: usize = 10_000;

/// A known remote node. Peer equality is by id alone; address and ports may
/// change across restarts and are updated in place on the next observation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub address: String,
    pub gossip_port: u16,
    pub http_port: u16,
    pub enclave: String,
}

impl Peer {
    pub fn from_info(info: &NodeInfo) -> Self {
        Self {
            id: info.id.clone(),
            address: info.address.clone(),
            gossip_port: info.port,
            http_port: info.http_port,
            enclave: info.enclave.clone(),
        }
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            address: self.address.clone(),
            port: self.gossip_port,
            http_port: self.http_port,
            enclave: self.enclave.clone(),
        }
    }

    pub fn gossip_addr(&self) -> String {
        format!("{}:{}", self.address, self.gossip_port)
    }
}

/// The peer map and its parallel failure-count map. Adding a peer resets
/// its count; removing a peer removes both entries.
#[derive(Default)]
struct Registry {
    peers: HashMap<String, Peer>,
    failures: HashMap<String, u32>,
}

/// Counts a failed send towards eviction; at `MAX_PING_FAILURES` the peer
/// is dropped from the registry entirely.
fn record_send_failure(registry: &RwLock<Registry>, id: &str) {
    let mut registry = registry.write();
    let count = match registry.failures.get_mut(id) {
        Some(count) => {
            *count += 1;
            *count
        }
        None => return,
    };
    if count >= MAX_PING_FAILURES {
        registry.peers.remove(id);
        registry.failures.remove(id);
        tracing::info!(peer = %id, failures = count, "Evicting unresponsive peer");
    }
}

/// Bounded FIFO set of recently observed message ids.
struct SeenCache {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Records `id`; returns false if it was already present.
    fn observe(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

pub struct GossipProtocol {
    local: NodeInfo,
    replication_factor: u32,
    health_interval: Duration,
    topology_interval: Duration,
    transport: TransportHandle,
    registry: Arc<RwLock<Registry>>,
    seen: Mutex<SeenCache>,
    ids: MessageIds,
}

impl GossipProtocol {
    pub fn new(
        local: NodeInfo,
        replication_factor: u32,
        health_interval: Duration,
        topology_interval: Duration,
        transport: TransportHandle,
    ) -> Self {
        let ids = MessageIds::new(&local.id);
        Self {
            local,
            replication_factor,
            health_interval,
            topology_interval,
            transport,
            registry: Arc::new(RwLock::new(Registry::default())),
            seen: Mutex::new(SeenCache::new(SEEN_CACHE_CAPACITY)),
            ids,
        }
    }

    pub fn local_info(&self) -> &NodeInfo {
        &self.local
    }

    pub fn node_id(&self) -> &str {
        &self.local.id
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    pub fn next_message_id(&self) -> String {
        self.ids.next()
    }

    // --- Peer registry ---

    /// Adds or updates a peer, resetting its failure count. Returns true if
    /// the peer was not previously known. The local node is never added.
    pub fn add_peer(&self, peer: Peer) -> bool {
        if peer.id == self.local.id {
            return false;
        }
        let mut registry = self.registry.write();
        let newly_known = !registry.peers.contains_key(&peer.id);
        if newly_known {
            tracing::info!(peer = %peer.id, enclave = %peer.enclave, "Discovered peer");
        }
        registry.failures.insert(peer.id.clone(), 0);
        registry.peers.insert(peer.id.clone(), peer);
        newly_known
    }

    pub fn remove_peer(&self, id: &str) {
        let mut registry = self.registry.write();
        registry.peers.remove(id);
        registry.failures.remove(id);
    }

    pub fn peer(&self, id: &str) -> Option<Peer> {
        self.registry.read().peers.get(id).cloned()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.registry.read().peers.values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.read().peers.len()
    }

    /// Peers sharing the local enclave; the only ones eligible for
    /// data-bearing broadcasts.
    pub fn enclave_peers(&self) -> Vec<Peer> {
        self.registry
            .read()
            .peers
            .values()
            .filter(|peer| peer.enclave == self.local.enclave)
            .cloned()
            .collect()
    }

    pub fn enclave_peer_count(&self) -> usize {
        self.registry
            .read()
            .peers
            .values()
            .filter(|peer| peer.enclave == self.local.enclave)
            .count()
    }

    /// Any message received from a peer proves it alive.
    pub fn reset_failures(&self, id: &str) {
        if let Some(count) = self.registry.write().failures.get_mut(id) {
            *count = 0;
        }
    }

    pub fn note_send_failure(&self, id: &str) {
        record_send_failure(&self.registry, id);
    }

    #[cfg(test)]
    fn failure_count(&self, id: &str) -> Option<u32> {
        self.registry.read().failures.get(id).copied()
    }

    // --- Duplicate suppression ---

    /// Records a message id; returns false when it was already seen.
    pub fn observe_message(&self, message_id: &str) -> bool {
        self.seen.lock().observe(message_id)
    }

    // --- Dissemination ---

    /// Broadcasts a PUT to the local enclave, fanout-limited, excluding
    /// `skip`. Sends are issued concurrently; failures feed the peers'
    /// failure counters rather than surfacing to the caller. Returns how
    /// many peers were targeted.
    pub fn broadcast_put(&self, message: &Message, skip: Option<&str>) -> Result<usize> {
        if self.transport.is_stopped() {
            return Err(Error::Transport("transport is stopped".to_string()));
        }
        let targets = fanout::select(&self.enclave_peers(), skip);
        for peer in &targets {
            self.spawn_send(peer.clone(), message.clone());
        }
        Ok(targets.len())
    }

    /// Sends a targeted message to one known peer, awaiting the outcome.
    /// A failure is counted against the peer before being returned.
    pub async fn send_to_peer(&self, peer_id: &str, message: Message) -> Result<()> {
        let peer = self
            .peer(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        match self.transport.send(&peer.gossip_addr(), &message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.note_send_failure(peer_id);
                Err(e)
            }
        }
    }

    /// Fires one send off on its own task; the outcome only feeds the
    /// peer's failure counter.
    fn spawn_send(&self, peer: Peer, message: Message) {
        let transport = self.transport.clone();
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            if let Err(e) = transport.send(&peer.gossip_addr(), &message).await {
                tracing::debug!(peer = %peer.id, error = %e, "Broadcast send failed");
                record_send_failure(&registry, &peer.id);
            }
        });
    }

    // --- Health checking ---

    /// Periodic health loop: pings every known peer each interval. Pings
    /// cross enclave boundaries so operators see full membership.
    pub async fn run_health(self: Arc<Self>, shutdown_token: CancellationToken) {
        let mut timer = time::interval(self.health_interval);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::debug!("Health loop received shutdown signal.");
                    break;
                },
                _ = timer.tick() => self.ping_all(),
            }
        }
    }

    fn ping_all(&self) {
        for peer in self.peers() {
            let message = Message::ping(
                self.node_id(),
                &peer.id,
                self.local.clone(),
                self.next_message_id(),
            );
            self.spawn_send(peer, message);
        }
    }

    // --- Topology synchronization ---

    /// Periodic topology loop: while the registry knows fewer peers than the
    /// replication factor calls for, announce ourselves so the peers we do
    /// know send their view back.
    pub async fn run_topology(self: Arc<Self>, shutdown_token: CancellationToken) {
        let mut timer = time::interval(self.topology_interval);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::debug!("Topology loop received shutdown signal.");
                    break;
                },
                _ = timer.tick() => {
                    let wanted = self.replication_factor.saturating_sub(1) as usize;
                    if self.peer_count() < wanted {
                        self.announce_self();
                    }
                }
            }
        }
    }

    fn announce_self(&self) {
        for peer in self.peers() {
            let message = Message::sync(
                self.node_id(),
                Some(&peer.id),
                self.local.clone(),
                self.next_message_id(),
            );
            self.spawn_send(peer, message);
        }
    }

    // --- Inbound membership handling ---

    /// PING: learn the sender opportunistically and answer with a PONG
    /// carrying our own description so the sender can correct stale data.
    pub async fn handle_ping(&self, message: &Message) {
        if let Some(info) = &message.node_info {
            self.add_peer(Peer::from_info(info));
        }
        let pong = Message::pong(
            self.node_id(),
            &message.from,
            self.local.clone(),
            self.next_message_id(),
        );
        if let Err(e) = self.send_to_peer(&message.from, pong).await {
            tracing::debug!(peer = %message.from, error = %e, "Failed to answer ping");
        }
    }

    /// PONG: the carried description refreshes the sender's registry entry,
    /// including its enclave tag.
    pub fn handle_pong(&self, message: &Message) {
        if let Some(info) = &message.node_info {
            self.add_peer(Peer::from_info(info));
        }
    }

    /// SYNC: apply the carried peer description. A self-describing SYNC
    /// (`from == node_info.id`) is a solicitation and is answered with one
    /// SYNC per *other* known peer; propagated third-party descriptions are
    /// applied silently, which keeps sync storms from amplifying.
    pub async fn handle_sync(&self, message: &Message) {
        let Some(info) = &message.node_info else {
            tracing::warn!(from = %message.from, "SYNC without node_info");
            return;
        };
        let self_describing = message.from == info.id;
        self.add_peer(Peer::from_info(info));

        if !self_describing {
            return;
        }
        for peer in self.peers() {
            if peer.id == message.from {
                continue;
            }
            let reply = Message::sync(
                self.node_id(),
                Some(&message.from),
                peer.info(),
                self.next_message_id(),
            );
            if let Err(e) = self.send_to_peer(&message.from, reply).await {
                tracing::debug!(peer = %message.from, error = %e, "Failed to answer SYNC");
                break;
            }
        }
    }
}

// --- Unit Tests ---
