//! In-process network connecting `RaftNode`s that live in one runtime.
//!
//! Links can be cut per direction to build partitions, and an unreliable
//! mode adds random delivery delay, loss of requests and replies, and
//! duplicate delivery of requests. A call
//! to a peer that is not reachable fails after a short random delay rather
//! than immediately, like a real connect timeout would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;

use crate::raft::node::RaftNode;
use crate::raft::rpc::{RaftRequest, RaftResponse};
use crate::raft::timer::random_delay;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone)]
pub struct NetworkConditions {
    /// When false, messages are delayed and may be lost.
    pub reliable: bool,
    /// Probability that a request, and independently its reply, is lost.
    pub drop_rate: f64,
    /// Probability that a delivered request is handed to the peer a second
    /// time. Only the first reply goes back to the caller.
    pub duplicate_rate: f64,
    /// Upper bound of the random delivery delay in unreliable mode.
    pub max_delay_ms: u64,
    /// Upper bound of the delay before an unreachable peer is reported.
    pub unreachable_delay_ms: u64,
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self {
            reliable: true,
            drop_rate: 0.1,
            duplicate_rate: 0.1,
            max_delay_ms: 27,
            unreachable_delay_ms: 100,
        }
    }
}

impl NetworkConditions {
    pub fn unreliable(drop_rate: f64) -> Self {
        Self {
            reliable: false,
            drop_rate,
            ..Default::default()
        }
    }
}

pub struct LocalNetwork {
    nodes: RwLock<HashMap<u64, Weak<RaftNode>>>,
    // Directed (from, to) pairs that currently drop all traffic.
    blocked: RwLock<HashSet<(u64, u64)>>,
    conditions: RwLock<NetworkConditions>,
    rpc_count: AtomicU64,
    duplicate_count: AtomicU64,
}

impl LocalNetwork {
    pub fn new(conditions: NetworkConditions) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            blocked: RwLock::new(HashSet::new()),
            conditions: RwLock::new(conditions),
            rpc_count: AtomicU64::new(0),
            duplicate_count: AtomicU64::new(0),
        })
    }

    /// Client end used by node `from` to reach its peers.
    pub fn transport(self: &Arc<Self>, from: u64) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            from,
        })
    }

    /// Make `node` reachable under its id, replacing any earlier instance.
    pub async fn register(&self, node: &Arc<RaftNode>) {
        self.nodes
            .write()
            .await
            .insert(node.id, Arc::downgrade(node));
    }

    pub async fn unregister(&self, node_id: u64) {
        self.nodes.write().await.remove(&node_id);
    }

    /// Cut both directions between `a` and `b`.
    pub async fn disconnect(&self, a: u64, b: u64) {
        let mut blocked = self.blocked.write().await;
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    pub async fn reconnect(&self, a: u64, b: u64) {
        let mut blocked = self.blocked.write().await;
        blocked.remove(&(a, b));
        blocked.remove(&(b, a));
    }

    /// Cut every link between `group_a` and `group_b`.
    pub async fn partition(&self, group_a: &[u64], group_b: &[u64]) {
        for &a in group_a {
            for &b in group_b {
                self.disconnect(a, b).await;
            }
        }
    }

    /// Cut `node_id` off from every other registered node.
    pub async fn isolate(&self, node_id: u64) {
        let others = self.other_ids(node_id).await;
        self.partition(&[node_id], &others).await;
    }

    /// Restore every link of `node_id`.
    pub async fn heal(&self, node_id: u64) {
        self.blocked
            .write()
            .await
            .retain(|&(from, to)| from != node_id && to != node_id);
    }

    pub async fn heal_all(&self) {
        self.blocked.write().await.clear();
    }

    pub async fn set_conditions(&self, conditions: NetworkConditions) {
        *self.conditions.write().await = conditions;
    }

    /// Total number of calls attempted through this network.
    pub fn rpc_count(&self) -> u64 {
        self.rpc_count.load(Ordering::Relaxed)
    }

    /// Requests delivered a second time in unreliable mode.
    pub fn duplicate_count(&self) -> u64 {
        self.duplicate_count.load(Ordering::Relaxed)
    }

    pub async fn is_linked(&self, from: u64, to: u64) -> bool {
        !self.blocked.read().await.contains(&(from, to))
    }

    async fn other_ids(&self, node_id: u64) -> Vec<u64> {
        self.nodes
            .read()
            .await
            .keys()
            .filter(|&&id| id != node_id)
            .copied()
            .collect()
    }

    async fn reachable(&self, from: u64, to: u64) -> Option<Arc<RaftNode>> {
        if !self.is_linked(from, to).await {
            return None;
        }
        self.nodes.read().await.get(&to).and_then(Weak::upgrade)
    }

    async fn deliver(
        &self,
        from: u64,
        to: u64,
        request: RaftRequest,
    ) -> Result<RaftResponse, TransportError> {
        self.rpc_count.fetch_add(1, Ordering::Relaxed);
        let conditions = self.conditions.read().await.clone();

        let Some(target) = self.reachable(from, to).await else {
            tokio::time::sleep(random_delay(0, conditions.unreachable_delay_ms)).await;
            return Err(TransportError::Unreachable(to));
        };

        if !conditions.reliable {
            tokio::time::sleep(random_delay(0, conditions.max_delay_ms)).await;
            if happens(conditions.drop_rate) {
                return Err(TransportError::Dropped(to));
            }
        }

        let duplicate = (!conditions.reliable && happens(conditions.duplicate_rate))
            .then(|| request.clone());

        let response =
            target
                .handle_request(request)
                .await
                .map_err(|e| TransportError::Remote {
                    peer: to,
                    reason: e.to_string(),
                })?;

        if let Some(copy) = duplicate {
            self.duplicate_count.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(from, to, method = copy.method(), "Delivering duplicate request");
            // The copy's reply is never seen by the caller.
            let _ = target.handle_request(copy).await;
        }

        // The reply travels back over the same link, which may have been cut
        // while the peer was handling the request.
        if !self.is_linked(to, from).await {
            return Err(TransportError::Unreachable(to));
        }
        if !conditions.reliable && happens(conditions.drop_rate) {
            return Err(TransportError::Dropped(to));
        }

        Ok(response)
    }
}

fn happens(rate: f64) -> bool {
    rand::thread_rng().gen_bool(rate.clamp(0.0, 1.0))
}

/// `Transport` handle bound to one sending node.
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    from: u64,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(
        &self,
        peer: u64,
        request: RaftRequest,
    ) -> Result<RaftResponse, TransportError> {
        self.network.deliver(self.from, peer, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::persist::MemoryPersister;
    use crate::raft::rpc::VoteRequest;
    use tokio::sync::mpsc;

    fn vote(term: u64, candidate_id: u64) -> RaftRequest {
        RaftRequest::RequestVote(VoteRequest {
            term,
            candidate_id,
            last_log_index: 0,
            last_log_term: 0,
        })
    }

    async fn registered_node(network: &Arc<LocalNetwork>, id: u64) -> Arc<RaftNode> {
        let peers: Vec<u64> = [1, 2, 3].into_iter().filter(|&p| p != id).collect();
        let config = NodeConfig::new(id).with_peers(peers);
        let (apply_tx, _apply_rx) = mpsc::channel(1);
        let node = Arc::new(
            RaftNode::new(
                config,
                network.transport(id),
                Arc::new(MemoryPersister::new()),
                apply_tx,
            )
            .unwrap(),
        );
        network.register(&node).await;
        node
    }

    fn fast_failure() -> NetworkConditions {
        NetworkConditions {
            unreachable_delay_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn delivers_to_registered_node() {
        let network = LocalNetwork::new(fast_failure());
        let _node = registered_node(&network, 2).await;

        let reply = network.transport(1).call(2, vote(1, 1)).await.unwrap();

        assert_eq!(
            reply,
            RaftResponse::RequestVote(crate::raft::rpc::VoteResponse {
                term: 1,
                vote_granted: true,
            })
        );
        assert_eq!(network.rpc_count(), 1);
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let network = LocalNetwork::new(fast_failure());

        let result = network.transport(1).call(9, vote(1, 1)).await;

        assert_eq!(result, Err(TransportError::Unreachable(9)));
    }

    #[tokio::test]
    async fn disconnect_and_reconnect() {
        let network = LocalNetwork::new(fast_failure());
        let _node = registered_node(&network, 2).await;

        network.disconnect(1, 2).await;
        assert!(!network.is_linked(1, 2).await);
        assert!(!network.is_linked(2, 1).await);
        assert_eq!(
            network.transport(1).call(2, vote(1, 1)).await,
            Err(TransportError::Unreachable(2))
        );

        network.reconnect(1, 2).await;
        assert!(network.transport(1).call(2, vote(1, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn isolate_and_heal() {
        let network = LocalNetwork::new(fast_failure());
        let _one = registered_node(&network, 1).await;
        let _two = registered_node(&network, 2).await;

        network.isolate(1).await;
        assert!(!network.is_linked(1, 2).await);
        assert!(!network.is_linked(2, 1).await);

        network.heal(1).await;
        assert!(network.is_linked(1, 2).await);
        assert!(network.is_linked(2, 1).await);
    }

    #[tokio::test]
    async fn dropped_node_is_unreachable() {
        let network = LocalNetwork::new(fast_failure());
        let node = registered_node(&network, 2).await;
        drop(node);

        assert_eq!(
            network.transport(1).call(2, vote(1, 1)).await,
            Err(TransportError::Unreachable(2))
        );
    }

    #[tokio::test]
    async fn killed_node_reports_remote_failure() {
        let network = LocalNetwork::new(fast_failure());
        let node = registered_node(&network, 2).await;
        node.kill();

        let result = network.transport(1).call(2, vote(1, 1)).await;
        assert!(matches!(result, Err(TransportError::Remote { peer: 2, .. })));
    }

    #[tokio::test]
    async fn total_loss_drops_everything() {
        let network = LocalNetwork::new(NetworkConditions {
            max_delay_ms: 1,
            ..NetworkConditions::unreliable(1.0)
        });
        let _node = registered_node(&network, 2).await;

        for _ in 0..5 {
            assert_eq!(
                network.transport(1).call(2, vote(1, 1)).await,
                Err(TransportError::Dropped(2))
            );
        }
    }

    #[tokio::test]
    async fn duplicated_vote_request_grants_one_vote() {
        let network = LocalNetwork::new(NetworkConditions {
            max_delay_ms: 1,
            duplicate_rate: 1.0,
            ..NetworkConditions::unreliable(0.0)
        });
        let voter = registered_node(&network, 3).await;

        let first = network.transport(1).call(3, vote(1, 1)).await.unwrap();
        let second = network.transport(2).call(3, vote(1, 2)).await.unwrap();

        assert_eq!(
            first,
            RaftResponse::RequestVote(crate::raft::rpc::VoteResponse {
                term: 1,
                vote_granted: true,
            })
        );
        assert_eq!(
            second,
            RaftResponse::RequestVote(crate::raft::rpc::VoteResponse {
                term: 1,
                vote_granted: false,
            })
        );
        assert_eq!(network.rpc_count(), 2);
        assert_eq!(network.duplicate_count(), 2);

        let status = voter.status().await;
        assert_eq!(status.term, 1);
        assert_eq!(status.voted_for, Some(1));
    }
}
