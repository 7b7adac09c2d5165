//! tests/integration/replication.rs
//!
//! End-to-end tests for the write path: single-node writes, two-node
//! replication, overwrites, and TTL expiration, all against real nodes on
//! loopback ports.

use crate::common::harness::{self, TestNode};
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_single_node_write_read() {
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let node = TestNode::spawn(vec![], "default").await.unwrap();

        // With no peers the write must succeed immediately, quorum 1.
        node.handle
            .node
            .put("alpha", b"hello".to_vec(), Duration::from_secs(600))
            .await
            .expect("singleton write should succeed");

        let found = node.handle.node.get("alpha").expect("entry should exist");
        assert_eq!(found.value, b"hello");
        assert_eq!(found.ttl, Duration::from_secs(600));
        assert!(found.remaining() <= Duration::from_secs(600));
        assert_eq!(node.handle.node.scan(), vec!["alpha".to_string()]);

        node.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_two_node_replication() {
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn(vec![], "default").await.unwrap();
        let node_b = TestNode::spawn(vec![node_a.seed_addr()], "default")
            .await
            .unwrap();

        // Bootstrap is mutual: the seed learns the joiner from the request.
        assert!(
            harness::wait_for_discovery(&[&node_a, &node_b], 1, Duration::from_secs(5)).await,
            "nodes should discover each other"
        );

        node_a
            .handle
            .node
            .put("k", b"v".to_vec(), Duration::from_secs(300))
            .await
            .expect("replicated write should reach quorum");

        // The write returned Ok, so the replica acknowledged after storing.
        let replicated = harness::wait_until(Duration::from_millis(200), || {
            node_b.handle.node.get("k").is_some()
        })
        .await;
        assert!(replicated, "entry should appear on the peer");
        let found = node_b.handle.node.get("k").unwrap();
        assert_eq!(found.value, b"v");
        assert_eq!(found.ttl, Duration::from_secs(300));

        node_a.shutdown().await;
        node_b.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_overwrite_keeps_a_single_entry() {
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let node = TestNode::spawn(vec![], "default").await.unwrap();
        let core = &node.handle.node;

        core.put("k", b"one".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let first = core.get("k").unwrap();
        core.put("k", b"two".to_vec(), Duration::from_secs(120))
            .await
            .unwrap();

        let second = core.get("k").unwrap();
        assert_eq!(second.value, b"two");
        assert_eq!(second.ttl, Duration::from_secs(120));
        assert!(second.created_at >= first.created_at);
        assert_eq!(core.scan().len(), 1);

        node.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_ttl_expiration() {
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let node = TestNode::spawn(vec![], "default").await.unwrap();

        node.handle
            .node
            .put("e", b"ephemeral".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(node.handle.node.get("e").is_some());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(node.handle.node.get("e").is_none(), "entry should expire");
        assert!(
            !node.handle.node.scan().contains(&"e".to_string()),
            "expired entries never appear in a scan"
        );

        node.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_requested_ttl_is_clamped() {
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let node = TestNode::spawn_with(vec![], "default", |config| {
            config.min_ttl_secs = 30;
            config.max_ttl_secs = 60;
        })
        .await
        .unwrap();
        let core = &node.handle.node;

        core.put("lo", b"x".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        core.put("hi", b"y".to_vec(), Duration::from_secs(9_999))
            .await
            .unwrap();
        assert_eq!(core.get("lo").unwrap().ttl, Duration::from_secs(30));
        assert_eq!(core.get("hi").unwrap().ttl, Duration::from_secs(60));

        node.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}
