//! src/bootstrap.rs
//!
//! The one-shot join handshake. A starting node walks its seed list until
//! one answers with a topology snapshot; a seed answers joiners and spreads
//! the news. Exhausting the seed list is not an error: the node simply
//! starts as a singleton.

use crate::{
    gossip::{GossipProtocol, Peer},
    transport::TransportHandle,
    wire::{BootstrapRequest, BootstrapResponse, Message, NodeInfo},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

const ANNOUNCE_ATTEMPTS: u32 = 3;
const ANNOUNCE_BACKOFF: Duration = Duration::from_millis(200);

/// Joins the cluster through the first seed that responds, adding every
/// returned peer to the registry. Returns how many peers were learned.
pub async fn join(
    seeds: &[String],
    transport: &TransportHandle,
    gossip: &Arc<GossipProtocol>,
) -> usize {
    let local = gossip.local_info();
    let request = BootstrapRequest {
        node_id: local.id.clone(),
        address: local.address.clone(),
        gossip_port: local.port,
        http_port: local.http_port,
        enclave: local.enclave.clone(),
    };

    for seed in seeds {
        match transport.bootstrap(seed, &request).await {
            Ok(response) if response.success => {
                let mut added = 0;
                for info in &response.peers {
                    if info.id != local.id && gossip.add_peer(Peer::from_info(info)) {
                        added += 1;
                    }
                }
                tracing::info!(seed = %seed, peers = added, "Joined cluster via seed");
                return added;
            }
            Ok(_) => tracing::warn!(seed = %seed, "Seed refused bootstrap"),
            Err(e) => tracing::warn!(seed = %seed, error = %e, "Bootstrap attempt failed"),
        }
    }
    if !seeds.is_empty() {
        tracing::warn!("All seeds failed; starting as a singleton");
    }
    0
}

/// Seed side: registers the joiner, announces it to the rest of the cluster
/// in the background, and returns the full topology including ourselves.
pub fn respond(gossip: &Arc<GossipProtocol>, request: BootstrapRequest) -> BootstrapResponse {
    let joiner = NodeInfo {
        id: request.node_id,
        address: request.address,
        port: request.gossip_port,
        http_port: request.http_port,
        enclave: request.enclave,
    };
    tracing::info!(peer = %joiner.id, enclave = %joiner.enclave, "Bootstrap request");
    gossip.add_peer(Peer::from_info(&joiner));

    let mut peers = vec![gossip.local_info().clone()];
    peers.extend(gossip.peers().iter().map(Peer::info));

    let gossip = Arc::clone(gossip);
    tokio::spawn(async move {
        announce_new_peer(gossip, joiner).await;
    });

    BootstrapResponse {
        success: true,
        peers,
    }
}

/// Tells every other known peer about the newcomer, retrying each with
/// exponential backoff.
async fn announce_new_peer(gossip: Arc<GossipProtocol>, joiner: NodeInfo) {
    let others: Vec<Peer> = gossip
        .peers()
        .into_iter()
        .filter(|peer| peer.id != joiner.id)
        .collect();

    for peer in others {
        let mut backoff = ANNOUNCE_BACKOFF;
        for attempt in 1..=ANNOUNCE_ATTEMPTS {
            let message = Message::sync(
                gossip.node_id(),
                Some(&peer.id),
                joiner.clone(),
                gossip.next_message_id(),
            );
            match gossip.send_to_peer(&peer.id, message).await {
                Ok(()) => break,
                Err(e) if attempt < ANNOUNCE_ATTEMPTS => {
                    tracing::debug!(peer = %peer.id, attempt, error = %e, "Announce failed; retrying");
                    time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer.id, error = %e, "Giving up announcing new peer")
                }
            }
        }
    }
}
