//! src/gossip/fanout.rs
//!
//! Implements the broadcast fanout policy. By isolating this logic, the
//! policy can be easily analyzed, tested, and replaced.

use crate::gossip::Peer;
use rand::{seq::SliceRandom, thread_rng};

/// Below or at this many eligible peers, broadcasts go to everyone. Above
/// it, each node relays to a random √N subset so a message still reaches
/// all members in O(log N) rounds.
pub const FANOUT_THRESHOLD: usize = 10;

/// Selects the peers a broadcast is sent to.
///
/// # Arguments
/// * `peers` - The candidate peers (already enclave-filtered by the caller).
/// * `skip` - A node id to exclude, typically the message originator or the
///   immediate sender when relaying.
pub fn select(peers: &[Peer], skip: Option<&str>) -> Vec<Peer> {
    let eligible: Vec<&Peer> = peers
        .iter()
        .filter(|peer| skip != Some(peer.id.as_str()))
        .collect();

    if eligible.len() <= FANOUT_THRESHOLD {
        return eligible.into_iter().cloned().collect();
    }

    let count = (eligible.len() as f64).sqrt().ceil() as usize;
    eligible
        .choose_multiple(&mut thread_rng(), count)
        .map(|peer| (*peer).clone())
        .collect()
}
