//! tests/component/node.rs
//!
//! In-process tests for the cluster node's message routing: messages are
//! crafted directly and fed to `handle_message`, bypassing the wire.

use crate::common::harness::TestNode;
use repram::{
    gossip::Peer,
    wire::{Message, NodeInfo},
    Error,
};
use std::time::Duration;
use test_log::test;

fn remote_info(id: &str, enclave: &str) -> NodeInfo {
    NodeInfo {
        id: id.to_string(),
        address: "127.0.0.1".to_string(),
        // An unroutable loopback port: sends to this peer fail or hang, and
        // these tests never depend on them succeeding.
        port: 1,
        http_port: 1,
        enclave: enclave.to_string(),
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_replicated_put_is_stored_with_message_ttl() {
    let node = TestNode::spawn(vec![], "default").await.unwrap();
    let core = &node.handle.node;

    let put = Message::put(
        "ghost",
        "k",
        b"replica".to_vec(),
        Duration::from_secs(120),
        "ghost-1-0".to_string(),
    );
    core.handle_message(put).await;

    let found = core.get("k").expect("replicated entry should be stored");
    assert_eq!(found.value, b"replica");
    assert_eq!(found.ttl, Duration::from_secs(120));

    node.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_duplicate_put_is_dropped() {
    let node = TestNode::spawn(vec![], "default").await.unwrap();
    let core = &node.handle.node;

    let first = Message::put(
        "ghost",
        "k",
        b"one".to_vec(),
        Duration::from_secs(120),
        "ghost-1-7".to_string(),
    );
    core.handle_message(first).await;

    // Same message id arriving through another path, different payload.
    let echo = Message::put(
        "ghost",
        "k",
        b"two".to_vec(),
        Duration::from_secs(120),
        "ghost-1-7".to_string(),
    );
    core.handle_message(echo).await;

    assert_eq!(core.get("k").unwrap().value, b"one", "duplicate must not re-store");
    assert_eq!(core.scan().len(), 1);

    node.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_ack_for_unknown_write_is_ignored() {
    let node = TestNode::spawn(vec![], "default").await.unwrap();

    let stray = Message::ack("ghost", "nobody", Some("k".to_string()), "nobody-5-5");
    node.handle.node.handle_message(stray).await;
    // Nothing to assert beyond "no effect": the store stays empty.
    assert!(node.handle.node.scan().is_empty());

    node.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_ping_from_unknown_sender_adds_peer() {
    let node = TestNode::spawn(vec![], "default").await.unwrap();

    let ping = Message::ping(
        "stranger",
        node.node_id().as_str(),
        remote_info("stranger", "default"),
        "stranger-1-0".to_string(),
    );
    node.handle.node.handle_message(ping).await;

    let peers = node.handle.node.topology();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, "stranger");

    node.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_sync_updates_registry_and_enclave() {
    let node = TestNode::spawn(vec![], "default").await.unwrap();
    let core = &node.handle.node;

    // Self-describing SYNC from an unknown node.
    let sync = Message::sync(
        "wanderer",
        None,
        remote_info("wanderer", "default"),
        "wanderer-1-0".to_string(),
    );
    core.handle_message(sync).await;
    assert_eq!(core.topology().len(), 1);

    // A later SYNC corrects the enclave tag in place.
    let moved = Message::sync(
        "wanderer",
        None,
        remote_info("wanderer", "blue"),
        "wanderer-1-1".to_string(),
    );
    core.handle_message(moved).await;
    let peers = core.topology();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].enclave, "blue");

    node.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_third_party_sync_is_applied_silently() {
    let node = TestNode::spawn(vec![], "default").await.unwrap();

    // from != node_info.id: propagated knowledge about someone else.
    let gossip_about = Message::sync(
        "relayer",
        None,
        remote_info("subject", "default"),
        "relayer-1-0".to_string(),
    );
    node.handle.node.handle_message(gossip_about).await;

    let peers = node.handle.node.topology();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, "subject");

    node.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_write_times_out_without_acks() {
    let node = TestNode::spawn_with(vec![], "default", |config| {
        config.write_timeout_ms = 500;
    })
    .await
    .unwrap();

    // A registered but silent enclave peer forces required_acks = 1.
    node.handle
        .gossip
        .add_peer(Peer::from_info(&remote_info("silent", "default")));

    let outcome = node
        .handle
        .node
        .put("k", b"v".to_vec(), Duration::from_secs(60))
        .await;
    assert!(matches!(outcome, Err(Error::QuorumTimeout(_))));
    // The local entry survives the failed quorum.
    assert_eq!(node.handle.node.get("k").unwrap().value, b"v");

    node.shutdown().await;
}
