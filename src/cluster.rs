//! A whole cluster of `RaftNode`s running in one process over a
//! [`LocalNetwork`], with crash, restart and partition controls.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::persist::{FilePersister, MemoryPersister, Persister};
use crate::raft::node::{ApplyMsg, NodeStatus, RaftNode};
use crate::transport::{LocalNetwork, NetworkConditions};

const APPLY_CHANNEL_CAPACITY: usize = 64;

struct RunningNode {
    node: Arc<RaftNode>,
    handle: JoinHandle<()>,
    _apply_rx: mpsc::Receiver<ApplyMsg>,
}

pub struct LocalCluster {
    network: Arc<LocalNetwork>,
    template: NodeConfig,
    ids: Vec<u64>,
    persisters: BTreeMap<u64, Arc<dyn Persister>>,
    running: BTreeMap<u64, RunningNode>,
}

impl LocalCluster {
    /// Start `size` nodes with ids `1..=size`.
    ///
    /// Timing settings come from `template`; its node id and peers are
    /// replaced per node. With `state_dir` set, each node persists to
    /// `node-<id>.state` in that directory, otherwise to memory.
    pub async fn start(
        size: usize,
        template: NodeConfig,
        conditions: NetworkConditions,
        state_dir: Option<&Path>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(RaftError::InvalidConfig(
                "cluster needs at least one node".to_string(),
            ));
        }

        let ids: Vec<u64> = (1..=size as u64).collect();
        let persisters = ids
            .iter()
            .map(|&id| {
                let persister: Arc<dyn Persister> = match state_dir {
                    Some(dir) => Arc::new(FilePersister::in_dir(dir, id)),
                    None => Arc::new(MemoryPersister::new()),
                };
                (id, persister)
            })
            .collect();

        let mut cluster = Self {
            network: LocalNetwork::new(conditions),
            template,
            ids,
            persisters,
            running: BTreeMap::new(),
        };

        for id in cluster.ids.clone() {
            cluster.boot(id).await?;
        }

        tracing::info!(
            nodes = size,
            state_dir = ?state_dir,
            "Local cluster started"
        );
        Ok(cluster)
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Every member id, running or not.
    pub fn node_ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn running_ids(&self) -> Vec<u64> {
        self.running.keys().copied().collect()
    }

    pub fn node(&self, node_id: u64) -> Option<Arc<RaftNode>> {
        self.running.get(&node_id).map(|running| running.node.clone())
    }

    /// Running nodes that currently believe they lead, as `(id, term)`.
    pub async fn leaders(&self) -> Vec<(u64, u64)> {
        let mut leaders = Vec::new();
        for (&id, running) in &self.running {
            let (term, is_leader) = running.node.get_state().await;
            if is_leader {
                leaders.push((id, term));
            }
        }
        leaders
    }

    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::with_capacity(self.running.len());
        for running in self.running.values() {
            statuses.push(running.node.status().await);
        }
        statuses
    }

    /// Kill a node and take it off the network. Its persisted state is kept.
    pub async fn crash(&mut self, node_id: u64) -> bool {
        let Some(running) = self.running.remove(&node_id) else {
            return false;
        };
        running.node.kill();
        self.network.unregister(node_id).await;
        if let Err(e) = running.handle.await {
            tracing::warn!(node_id, error = %e, "Node task ended abnormally");
        }
        tracing::info!(node_id, "Node crashed");
        true
    }

    /// Replace a node with a fresh instance built from its persisted state.
    pub async fn restart(&mut self, node_id: u64) -> Result<()> {
        if !self.ids.contains(&node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} is not a cluster member",
                node_id
            )));
        }
        self.crash(node_id).await;
        self.boot(node_id).await?;
        tracing::info!(node_id, "Node restarted");
        Ok(())
    }

    pub async fn isolate(&self, node_id: u64) {
        tracing::info!(node_id, "Isolating node");
        self.network.isolate(node_id).await;
    }

    pub async fn heal(&self, node_id: u64) {
        tracing::info!(node_id, "Healing node");
        self.network.heal(node_id).await;
    }

    pub async fn heal_all(&self) {
        self.network.heal_all().await;
    }

    pub async fn partition(&self, group_a: &[u64], group_b: &[u64]) {
        tracing::info!(?group_a, ?group_b, "Partitioning cluster");
        self.network.partition(group_a, group_b).await;
    }

    /// Kill every node and wait for their loops to exit.
    pub async fn shutdown(&mut self) {
        for id in self.running_ids() {
            self.crash(id).await;
        }
        tracing::info!("Local cluster stopped");
    }

    fn config_for(&self, node_id: u64) -> NodeConfig {
        NodeConfig {
            node_id,
            peers: self.ids.iter().copied().filter(|&id| id != node_id).collect(),
            ..self.template.clone()
        }
    }

    async fn boot(&mut self, node_id: u64) -> Result<()> {
        let persister = self
            .persisters
            .get(&node_id)
            .cloned()
            .ok_or_else(|| RaftError::InvalidConfig(format!("no storage for node {}", node_id)))?;

        let (apply_tx, apply_rx) = mpsc::channel(APPLY_CHANNEL_CAPACITY);
        let node = Arc::new(RaftNode::new(
            self.config_for(node_id),
            self.network.transport(node_id),
            persister,
            apply_tx,
        )?);
        self.network.register(&node).await;
        let handle = node.spawn();

        self.running.insert(
            node_id,
            RunningNode {
                node,
                handle,
                _apply_rx: apply_rx,
            },
        );
        Ok(())
    }
}
