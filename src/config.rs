use std::collections::HashSet;
use std::time::Duration;

use crate::error::{RaftError, Result};

/// Configuration for a single Raft peer.
///
/// The follower's election timeout is detected by polling: the window of
/// `election_timeout_ms` is split into `election_poll_slices` sleeps, and the
/// role/heartbeat flags are re-checked after each one. A timeout is therefore
/// noticed at most one slice (`election_timeout_ms / election_poll_slices`)
/// after the window actually ends, and a role change made by another flow is
/// picked up within one slice.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    /// Every other member of the cluster. The set is fixed for the node's lifetime.
    pub peers: Vec<u64>,
    pub election_timeout_ms: u64,
    pub election_poll_slices: u32,
    /// Candidates wait a uniform random delay in `[0, election_jitter_max_ms)`
    /// before soliciting votes.
    pub election_jitter_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Deadline applied to every outbound RPC on top of the transport.
    pub rpc_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            election_timeout_ms: 300,
            election_poll_slices: 200,
            election_jitter_max_ms: 800,
            heartbeat_interval_ms: 120,
            rpc_timeout_ms: 100,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64) -> Self {
        self.peers.push(node_id);
        self
    }

    pub fn with_peers(mut self, peers: impl IntoIterator<Item = u64>) -> Self {
        self.peers.extend(peers);
        self
    }

    /// Number of voting members, including this node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Smallest number of members (including this node) that forms a majority.
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Number of positive replies needed from other peers once this node's
    /// own vote or acknowledgement is counted.
    pub fn peer_quorum(&self) -> usize {
        self.majority() - 1
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// Length of one polling slice of the election timeout window.
    pub fn election_poll_slice(&self) -> Duration {
        self.election_timeout() / self.election_poll_slices.max(1)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.peers.contains(&self.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self.peers.iter().find(|id| !seen.insert(**id)) {
            return Err(RaftError::InvalidConfig(format!("peer {} listed twice", dup)));
        }

        if self.election_poll_slices == 0 {
            return Err(RaftError::InvalidConfig(
                "election_poll_slices must be positive".to_string(),
            ));
        }

        if self.election_poll_slice() < Duration::from_millis(1) {
            return Err(RaftError::InvalidConfig(format!(
                "election poll slice is below 1ms ({}ms window / {} slices)",
                self.election_timeout_ms, self.election_poll_slices
            )));
        }

        if self.heartbeat_interval_ms >= self.election_timeout_ms {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval ({}ms) must be shorter than the election timeout ({}ms)",
                self.heartbeat_interval_ms, self.election_timeout_ms
            )));
        }

        if self.rpc_timeout_ms == 0 {
            return Err(RaftError::InvalidConfig(
                "rpc_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
