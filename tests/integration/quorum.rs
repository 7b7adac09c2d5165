//! tests/integration/quorum.rs
//!
//! Tests for the acknowledgement-driven write path: a successful `put`
//! implies a quorum actually stored the entry, and a partitioned cluster
//! times out while retaining the local copy.

use crate::common::harness::{self, TestNode};
use repram::Error;
use std::time::{Duration, Instant};
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_put_ok_implies_replica_stored() {
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn(vec![], "default").await.unwrap();
        let node_b = TestNode::spawn(vec![node_a.seed_addr()], "default")
            .await
            .unwrap();
        assert!(harness::wait_for_discovery(&[&node_a, &node_b], 1, Duration::from_secs(5)).await);

        node_a
            .handle
            .node
            .put("durable", b"v".to_vec(), Duration::from_secs(300))
            .await
            .expect("write should reach quorum");

        // The ACK is only sent after the replica stores the entry, so an Ok
        // result means it is already readable there.
        assert!(node_b.handle.node.get("durable").is_some());

        node_a.shutdown().await;
        node_b.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_partition_yields_quorum_timeout_and_keeps_local_copy() {
    let test_timeout = Duration::from_secs(25);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn(vec![], "default").await.unwrap();
        let node_b = TestNode::spawn(vec![node_a.seed_addr()], "default")
            .await
            .unwrap();
        assert!(harness::wait_for_discovery(&[&node_a, &node_b], 1, Duration::from_secs(5)).await);

        // Partition: node B goes dark but remains in A's registry.
        node_b.kill();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let started = Instant::now();
        let outcome = node_a
            .handle
            .node
            .put("z", b"zz".to_vec(), Duration::from_secs(300))
            .await;
        let elapsed = started.elapsed();

        assert!(
            matches!(outcome, Err(Error::QuorumTimeout(_))),
            "write should time out waiting for acks, got {outcome:?}"
        );
        // The configured write timeout is 2 s.
        assert!(elapsed >= Duration::from_millis(1_900), "returned too early");
        assert!(elapsed < Duration::from_secs(5), "returned too late");

        // The local copy is retained for convergence through gossip.
        assert_eq!(node_a.handle.node.get("z").unwrap().value, b"zz");

        node_a.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}
