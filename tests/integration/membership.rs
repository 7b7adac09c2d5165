//! tests/integration/membership.rs
//!
//! E2E tests for cluster membership: topology convergence through the
//! seed's announcements and SYNC exchange, and health-driven eviction with
//! rejoin.

use crate::common::harness::{self, TestNode};
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_topology_converges_through_one_seed() {
    let test_timeout = Duration::from_secs(20);
    let result = tokio::time::timeout(test_timeout, async {
        // B and C only ever hear about each other indirectly: C gets B from
        // the seed's bootstrap response, B gets C from the seed's announce.
        let node_a = TestNode::spawn(vec![], "default").await.unwrap();
        let node_b = TestNode::spawn(vec![node_a.seed_addr()], "default")
            .await
            .unwrap();
        let node_c = TestNode::spawn(vec![node_a.seed_addr()], "default")
            .await
            .unwrap();

        assert!(
            harness::wait_for_discovery(&[&node_a, &node_b, &node_c], 2, Duration::from_secs(8))
                .await,
            "every node should learn the full topology"
        );
        let b_id = node_b.node_id();
        assert!(
            node_c
                .handle
                .gossip
                .peers()
                .iter()
                .any(|peer| peer.id == b_id),
            "node C should know node B by id"
        );

        node_a.shutdown().await;
        node_b.shutdown().await;
        node_c.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_dead_peer_is_evicted_and_can_rejoin() {
    let test_timeout = Duration::from_secs(60);
    let result = tokio::time::timeout(test_timeout, async {
        // Aggressive health checking so eviction happens within the test.
        let node_a = TestNode::spawn_with(vec![], "default", |config| {
            config.health_interval_ms = 300;
        })
        .await
        .unwrap();
        let node_b = TestNode::spawn(vec![node_a.seed_addr()], "default")
            .await
            .unwrap();
        assert!(harness::wait_for_discovery(&[&node_a, &node_b], 1, Duration::from_secs(5)).await);

        // Phase 1: kill B and wait for three consecutive ping failures.
        // Each failed send is bounded by the transport timeout, so allow a
        // generous window.
        node_b.kill();
        let evicted = harness::wait_until(Duration::from_secs(30), || {
            node_a.handle.gossip.peer_count() == 0
        })
        .await;
        assert!(evicted, "node A should evict the dead peer");

        // Phase 2: a fresh node B rejoins through A and is tracked again.
        let node_b_restarted = TestNode::spawn(vec![node_a.seed_addr()], "default")
            .await
            .unwrap();
        let rejoined = harness::wait_until(Duration::from_secs(5), || {
            node_a.handle.gossip.peer_count() == 1
        })
        .await;
        assert!(rejoined, "node A should track the restarted peer");
        let b_id = node_b_restarted.node_id();
        assert!(node_a
            .handle
            .gossip
            .peers()
            .iter()
            .any(|peer| peer.id == b_id));

        node_a.shutdown().await;
        node_b_restarted.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}
