//! Test harness for multi-node Raft election integration tests.
//!
//! Wraps a `LocalCluster` with shortened timeouts and polling helpers.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use raft_election::cluster::LocalCluster;
use raft_election::config::NodeConfig;
use raft_election::raft::{RaftNode, RaftRole};
use raft_election::transport::NetworkConditions;

/// Test node configuration with shorter timeouts for faster tests
pub fn test_node_config() -> NodeConfig {
    NodeConfig {
        election_timeout_ms: 150,
        election_poll_slices: 15,
        election_jitter_max_ms: 150,
        heartbeat_interval_ms: 30,
        rpc_timeout_ms: 50,
        ..NodeConfig::default()
    }
}

/// Test cluster managing multiple nodes
pub struct TestCluster {
    pub cluster: LocalCluster,
}

impl TestCluster {
    /// Create and start a cluster with n nodes on a reliable network
    pub async fn new(num_nodes: usize) -> Self {
        Self::with_conditions(num_nodes, NetworkConditions::default()).await
    }

    pub async fn with_conditions(num_nodes: usize, conditions: NetworkConditions) -> Self {
        let cluster = LocalCluster::start(num_nodes, test_node_config(), conditions, None)
            .await
            .expect("cluster should start");
        Self { cluster }
    }

    /// Cluster whose nodes persist to files under `dir`
    pub async fn with_state_dir(num_nodes: usize, dir: &Path) -> Self {
        let cluster = LocalCluster::start(
            num_nodes,
            test_node_config(),
            NetworkConditions::default(),
            Some(dir),
        )
        .await
        .expect("cluster should start");
        Self { cluster }
    }

    pub fn get_node(&self, node_id: u64) -> Option<Arc<RaftNode>> {
        self.cluster.node(node_id)
    }

    pub fn active_node_ids(&self) -> Vec<u64> {
        self.cluster.running_ids()
    }

    /// Wait for leader election with timeout
    pub async fn wait_for_leader(&self, timeout_duration: Duration) -> Option<u64> {
        self.wait_for_leader_in_group(&self.active_node_ids(), timeout_duration)
            .await
    }

    /// Wait for a new leader among remaining nodes (excluding a specific node)
    pub async fn wait_for_new_leader(
        &self,
        excluded_node: u64,
        timeout_duration: Duration,
    ) -> Option<u64> {
        let group: Vec<u64> = self
            .active_node_ids()
            .into_iter()
            .filter(|&id| id != excluded_node)
            .collect();
        self.wait_for_leader_in_group(&group, timeout_duration).await
    }

    /// Wait until one of `group` believes it is the leader
    pub async fn wait_for_leader_in_group(
        &self,
        group: &[u64],
        timeout_duration: Duration,
    ) -> Option<u64> {
        let found = wait_for(
            || async { self.leader_in_group(group).await.is_some() },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await;

        if found {
            self.leader_in_group(group).await
        } else {
            None
        }
    }

    async fn leader_in_group(&self, group: &[u64]) -> Option<u64> {
        for &node_id in group {
            if let Some(node) = self.get_node(node_id) {
                if node.is_leader().await {
                    return Some(node_id);
                }
            }
        }
        None
    }

    /// Leader with the highest term, if any node believes it leads
    pub async fn get_leader_id(&self) -> Option<u64> {
        self.cluster
            .leaders()
            .await
            .into_iter()
            .max_by_key(|&(_, term)| term)
            .map(|(id, _)| id)
    }

    /// Count the number of leaders in the cluster
    pub async fn count_leaders(&self) -> usize {
        self.cluster.leaders().await.len()
    }

    pub async fn current_term(&self, node_id: u64) -> u64 {
        self.get_node(node_id)
            .expect("node should be running")
            .current_term()
            .await
    }

    pub async fn role(&self, node_id: u64) -> RaftRole {
        self.get_node(node_id)
            .expect("node should be running")
            .status()
            .await
            .role
    }

    /// Sample leaders for `duration` and return every leader id seen per term.
    pub async fn observe_leaders(&self, duration: Duration) -> BTreeMap<u64, BTreeSet<u64>> {
        let mut by_term: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
        let start = tokio::time::Instant::now();
        while start.elapsed() < duration {
            for (node_id, term) in self.cluster.leaders().await {
                by_term.entry(term).or_default().insert(node_id);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        by_term
    }

    /// Shutdown a specific node (simulates crash)
    pub async fn shutdown_node(&mut self, node_id: u64) -> bool {
        self.cluster.crash(node_id).await
    }

    pub async fn restart_node(&mut self, node_id: u64) {
        self.cluster
            .restart(node_id)
            .await
            .expect("node should restart");
    }

    pub async fn isolate(&self, node_id: u64) {
        self.cluster.isolate(node_id).await;
    }

    pub async fn heal(&self, node_id: u64) {
        self.cluster.heal(node_id).await;
    }

    pub async fn heal_all(&self) {
        self.cluster.heal_all().await;
    }

    /// Create a network partition: group_a can't communicate with group_b and vice versa
    pub async fn create_partition(&self, group_a: &[u64], group_b: &[u64]) {
        self.cluster.partition(group_a, group_b).await;
    }

    pub async fn shutdown(&mut self) {
        self.cluster.shutdown().await;
    }
}

/// Assert that no term ever had two different leaders.
pub fn assert_election_safety(by_term: &BTreeMap<u64, BTreeSet<u64>>) {
    for (term, leaders) in by_term {
        assert!(
            leaders.len() <= 1,
            "term {} had more than one leader: {:?}",
            term,
            leaders
        );
    }
}

/// Poll `condition` until it returns true or the timeout expires
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
