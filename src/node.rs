//! src/node.rs
//!
//! The cluster node: couples the store and the gossip layer, drives the
//! quorum write path, and routes every inbound wire message. This is the
//! surface the HTTP collaborator consumes.

use crate::{
    bootstrap,
    config::Config,
    error::{Error, Result},
    gossip::{GossipProtocol, Peer, FANOUT_THRESHOLD},
    store::{Found, Store},
    transport::Inbound,
    wire::{BootstrapRequest, BootstrapResponse, Message, MessageType},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Limit for concurrently handled inbound messages.
const MAX_CONCURRENT_HANDLERS: usize = 64;

/// Originator-side record of an in-flight quorum write. Completion is
/// signalled over the oneshot once the last required ACK arrives.
struct PendingWrite {
    remaining: u32,
    done: Option<oneshot::Sender<()>>,
}

/// How many remote acknowledgements a write needs before it is reported
/// successful: quorum is `replication_factor / 2 + 1` nodes including the
/// local one, capped by the nodes actually present in the enclave.
fn required_acks(replication_factor: u32, enclave_peers: usize) -> u32 {
    let quorum = replication_factor / 2 + 1;
    let effective = quorum.min(enclave_peers as u32 + 1);
    effective - 1
}

pub struct ClusterNode {
    store: Arc<Store>,
    gossip: Arc<GossipProtocol>,
    pending: Mutex<HashMap<String, PendingWrite>>,
    replication_factor: u32,
    write_timeout: Duration,
    min_ttl: Duration,
    max_ttl: Duration,
    cluster_secret: String,
}

impl ClusterNode {
    pub fn new(store: Arc<Store>, gossip: Arc<GossipProtocol>, config: &Config) -> Self {
        Self {
            store,
            gossip,
            pending: Mutex::new(HashMap::new()),
            replication_factor: config.replication_factor,
            write_timeout: config.write_timeout(),
            min_ttl: config.min_ttl(),
            max_ttl: config.max_ttl(),
            cluster_secret: config.cluster_secret.clone(),
        }
    }

    /// Stores `value` under `key` locally, replicates it to the enclave,
    /// and waits until the write is acknowledged to quorum or the write
    /// deadline passes. On `QuorumTimeout` the local copy is retained and
    /// converges through background gossip.
    pub async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let ttl = self.clamp_ttl(ttl);
        self.store.put(key, value.clone(), ttl)?;

        let enclave_peers = self.gossip.enclave_peer_count();
        if enclave_peers == 0 {
            return Ok(());
        }

        let message_id = self.gossip.next_message_id();
        // Our own broadcast may echo back through a relay; never re-store it.
        self.gossip.observe_message(&message_id);

        let required = required_acks(self.replication_factor, enclave_peers);
        let wait = (required > 0).then(|| self.register_pending(&message_id, required));

        let message = Message::put(self.gossip.node_id(), key, value, ttl, message_id.clone());
        let targets = self.gossip.broadcast_put(&message, None)?;
        tracing::debug!(key, targets, required, "Replicating write");

        let Some(done_rx) = wait else {
            return Ok(());
        };
        match time::timeout(self.write_timeout, done_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.pending.lock().remove(&message_id);
                Err(Error::Shutdown)
            }
            Err(_) => {
                self.pending.lock().remove(&message_id);
                tracing::warn!(key, "Write did not reach quorum before the deadline");
                Err(Error::QuorumTimeout(self.write_timeout))
            }
        }
    }

    /// Reads the live entry for `key` from the local store. There is no
    /// cross-node read repair.
    pub fn get(&self, key: &str) -> Option<Found> {
        self.store.get(key)
    }

    /// All live keys, lexicographically ordered.
    pub fn scan(&self) -> Vec<String> {
        self.store.scan()
    }

    pub fn size(&self) -> (usize, u64) {
        self.store.size()
    }

    /// Read-only view of the current peer registry.
    pub fn topology(&self) -> Vec<Peer> {
        self.gossip.peers()
    }

    /// The configured cluster secret, for collaborators that need to sign
    /// their own gossip endpoints.
    pub fn cluster_secret(&self) -> &str {
        &self.cluster_secret
    }

    pub fn quorum(&self) -> u32 {
        self.replication_factor / 2 + 1
    }

    fn clamp_ttl(&self, ttl: Duration) -> Duration {
        ttl.clamp(self.min_ttl, self.max_ttl)
    }

    fn register_pending(&self, message_id: &str, required: u32) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.lock().insert(
            message_id.to_string(),
            PendingWrite {
                remaining: required,
                done: Some(done_tx),
            },
        );
        done_rx
    }

    // --- Inbound routing ---

    /// Transport-inbound entry point: routes one wire message by type.
    pub async fn handle_message(&self, message: Message) {
        // Hearing from a peer at all proves it alive.
        self.gossip.reset_failures(&message.from);

        match message.kind {
            MessageType::Put => self.handle_put(message).await,
            MessageType::Ack => self.handle_ack(&message),
            MessageType::Ping => self.gossip.handle_ping(&message).await,
            MessageType::Pong => self.gossip.handle_pong(&message),
            MessageType::Sync => self.gossip.handle_sync(&message).await,
        }
    }

    /// A replicated write from a peer: store it with a fresh local creation
    /// time, relay it onward in large enclaves, and acknowledge the
    /// originator.
    async fn handle_put(&self, message: Message) {
        if !self.gossip.observe_message(&message.message_id) {
            tracing::trace!(message_id = %message.message_id, "Dropping duplicate PUT");
            return;
        }
        let (Some(key), Some(ttl)) = (message.key.as_deref(), message.ttl) else {
            tracing::warn!(from = %message.from, "PUT without key or ttl");
            return;
        };
        let value = message.data.clone().unwrap_or_default();
        if let Err(e) = self.store.put(key, value, Duration::from_secs(u64::from(ttl))) {
            tracing::warn!(key, error = %e, "Failed to store replicated write");
            return;
        }

        let originated_here = message.from == self.gossip.node_id();
        if !originated_here && self.gossip.enclave_peer_count() > FANOUT_THRESHOLD {
            // Relay so the write epidemically reaches the whole enclave.
            if let Err(e) = self.gossip.broadcast_put(&message, Some(&message.from)) {
                tracing::debug!(error = %e, "Relay failed");
            }
        }

        if !originated_here {
            let ack = Message::ack(
                self.gossip.node_id(),
                &message.from,
                message.key.clone(),
                &message.message_id,
            );
            if let Err(e) = self.gossip.send_to_peer(&message.from, ack).await {
                tracing::debug!(peer = %message.from, error = %e, "Failed to acknowledge write");
            }
        }
    }

    /// An acknowledgement for one of our in-flight writes. ACKs for unknown
    /// or already-completed writes are dropped silently.
    fn handle_ack(&self, message: &Message) {
        let mut pending = self.pending.lock();
        let Some(write) = pending.get_mut(&message.message_id) else {
            tracing::trace!(message_id = %message.message_id, "ACK for unknown or completed write");
            return;
        };
        write.remaining = write.remaining.saturating_sub(1);
        if write.remaining == 0 {
            if let Some(done) = write.done.take() {
                let _ = done.send(());
            }
            pending.remove(&message.message_id);
        }
    }

    /// Seed side of the join handshake (§ bootstrap): register the joiner,
    /// answer with the full topology, and announce the newcomer to everyone
    /// else in the background.
    pub async fn handle_bootstrap(&self, request: BootstrapRequest) -> BootstrapResponse {
        bootstrap::respond(&self.gossip, request)
    }

    /// The dispatch loop: drains the transport's inbound channel, handling
    /// each message on its own task drawn from a bounded pool.
    pub async fn run(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<Inbound>,
        shutdown_token: CancellationToken,
    ) {
        let handler_semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_HANDLERS));
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::debug!("Dispatch loop received shutdown signal.");
                    break;
                },
                inbound = inbound_rx.recv() => {
                    match inbound {
                        Some(Inbound::Gossip(message)) => {
                            let permit = match handler_semaphore.clone().acquire_owned().await {
                                Ok(p) => p,
                                Err(_) => break,
                            };
                            let node = Arc::clone(&self);
                            tokio::spawn(async move {
                                node.handle_message(message).await;
                                drop(permit);
                            });
                        }
                        Some(Inbound::Bootstrap { request, reply }) => {
                            let node = Arc::clone(&self);
                            tokio::spawn(async move {
                                let response = node.handle_bootstrap(request).await;
                                let _ = reply.send(response);
                            });
                        }
                        None => {
                            tracing::debug!("Inbound channel closed. Dispatch loop shutting down.");
                            break;
                        }
                    }
                }
            }
        }
        self.fail_pending();
    }

    /// Terminates every in-flight write. Dropping the completion channels
    /// wakes their waiters with a shutdown error.
    fn fail_pending(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Cancelling in-flight writes");
        }
        pending.clear();
    }
}

// --- Unit Tests ---
