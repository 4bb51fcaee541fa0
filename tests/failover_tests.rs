//! Failover tests for leader crashes and restarts.
//!
//! These tests verify that the survivors elect a new leader in a higher term
//! and that a restarted node rejoins as a follower.

mod test_harness;

use std::time::Duration;

use raft_election::raft::RaftRole;
use test_harness::{assert_eventually, TestCluster};

/// New leader is elected after leader shutdown
#[tokio::test]
async fn test_new_leader_election_after_shutdown() {
    let mut cluster = TestCluster::new(3).await;

    let initial_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let initial_term = cluster.current_term(initial_leader).await;

    assert!(
        cluster.shutdown_node(initial_leader).await,
        "Should successfully shutdown leader"
    );

    let new_leader = cluster
        .wait_for_new_leader(initial_leader, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");

    assert_ne!(new_leader, initial_leader);
    let new_term = cluster.current_term(new_leader).await;
    assert!(
        new_term > initial_term,
        "Term should increase after new election"
    );
    assert_eq!(cluster.count_leaders().await, 1);

    cluster.shutdown().await;
}

/// Followers notice the missing heartbeats and stand for election
#[tokio::test]
async fn test_follower_detects_leader_failure() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .expect("Should have at least one follower");

    assert_eventually(
        || async { cluster.role(follower_id).await == RaftRole::Follower },
        Duration::from_secs(2),
        "Follower should settle as follower",
    )
    .await;
    let term_before = cluster.current_term(follower_id).await;

    cluster.shutdown_node(leader_id).await;

    assert_eventually(
        || async { cluster.current_term(follower_id).await > term_before },
        Duration::from_secs(3),
        "Follower should move to a newer term after the leader dies",
    )
    .await;

    cluster.shutdown().await;
}

/// A crashed leader restarts as a follower and adopts the newer term
#[tokio::test]
async fn test_restarted_leader_rejoins_as_follower() {
    let mut cluster = TestCluster::new(3).await;

    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    cluster.shutdown_node(old_leader).await;

    cluster
        .wait_for_new_leader(old_leader, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");

    cluster.restart_node(old_leader).await;

    assert_eventually(
        || async {
            let Some(leader) = cluster.get_leader_id().await else {
                return false;
            };
            let node = cluster.get_node(old_leader).unwrap();
            let status = node.status().await;
            leader != old_leader
                && status.role == RaftRole::Follower
                && status.leader_id == Some(leader)
                && status.term == cluster.current_term(leader).await
        },
        Duration::from_secs(3),
        "Restarted node should follow the current leader",
    )
    .await;

    assert_eq!(cluster.count_leaders().await, 1);
    cluster.shutdown().await;
}

/// Two of three nodes down leaves no quorum; the survivor never leads
#[tokio::test]
async fn test_no_leader_without_quorum() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let survivor = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();
    for id in cluster.active_node_ids() {
        if id != survivor {
            cluster.shutdown_node(id).await;
        }
    }

    // The survivor keeps starting elections it cannot win.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(cluster.count_leaders().await, 0);
    assert_ne!(cluster.role(survivor).await, RaftRole::Leader);

    cluster.shutdown().await;
}
