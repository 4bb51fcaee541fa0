use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::persist::{PersistentState, Persister};
use crate::raft::quorum::{Decision, Outcome, QuorumCall};
use crate::raft::rpc::{
    handle_append_entries, handle_request_vote, AppendEntriesRequest, AppendEntriesResponse,
    RaftRequest, RaftResponse, VoteRequest, VoteResponse,
};
use crate::raft::state::{RaftRole, RaftState, TermCheck};
use crate::raft::timer::random_election_jitter;
use crate::transport::{Transport, TransportError};

/// Message delivered to the application for each committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub command_valid: bool,
    pub command: Vec<u8>,
    pub command_index: u64,
}

/// Answer to a command submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartResult {
    pub index: u64,
    pub term: u64,
    pub is_leader: bool,
}

/// Point-in-time view of a node, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub node_id: u64,
    pub term: u64,
    pub role: RaftRole,
    pub voted_for: Option<u64>,
    pub leader_id: Option<u64>,
}

/// A single Raft peer: election timeout detection, candidacy, leadership and
/// the inbound RPC handlers, all coordinated through one state lock.
///
/// Every read-decide-write step on term, role or vote takes the write lock
/// for its whole duration; the lock is never held across a network call.
pub struct RaftNode {
    pub id: u64,
    pub state: RwLock<RaftState>,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    persister: Arc<dyn Persister>,
    // TODO: deliver committed entries here once log replication lands.
    #[allow(dead_code)]
    apply_tx: mpsc::Sender<ApplyMsg>,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Create a node, restoring term and vote from `persister` if it holds
    /// any. The node stays idle until [`RaftNode::spawn`] is called.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Self> {
        config.validate()?;

        let state = match persister.load()? {
            Some(data) => {
                let persisted = PersistentState::decode(&data)?;
                tracing::info!(
                    node_id = config.node_id,
                    term = persisted.current_term,
                    voted_for = ?persisted.voted_for,
                    "Restored persisted state"
                );
                RaftState::restore(&persisted)
            }
            None => RaftState::new(),
        };

        Ok(Self {
            id: config.node_id,
            state: RwLock::new(state),
            config,
            transport,
            persister,
            apply_tx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Start the driver loop on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move { node.run().await })
    }

    /// Run the per-role driver loop until the node is killed.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(node_id = self.id, peers = ?self.config.peers, "Starting Raft node");

        while !self.killed() {
            let role = self.state.read().await.role;
            match role {
                RaftRole::Follower => self.watch_election_timeout().await,
                RaftRole::Candidate => self.run_election().await,
                RaftRole::Leader => self.lead().await,
            }
        }

        tracing::info!(node_id = self.id, "Raft node stopped");
    }

    /// Stop all background loops. Safe to call more than once.
    pub fn kill(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(node_id = self.id, "Killing Raft node");
            self.shutdown.cancel();
        }
    }

    pub fn killed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Current term and whether this node believes it is the leader.
    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.read().await;
        (state.current_term, state.role == RaftRole::Leader)
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    pub async fn current_term(&self) -> u64 {
        self.state.read().await.current_term
    }

    /// Get the current leader ID
    pub async fn leader_id(&self) -> Option<u64> {
        self.state.read().await.leader_id
    }

    pub async fn status(&self) -> NodeStatus {
        let state = self.state.read().await;
        NodeStatus {
            node_id: self.id,
            term: state.current_term,
            role: state.role,
            voted_for: state.voted_for,
            leader_id: state.leader_id,
        }
    }

    /// Submit a command for replication.
    ///
    /// The log is not replicated yet, so this always answers "not leader" and
    /// callers retry elsewhere.
    pub async fn start(&self, command: Vec<u8>) -> StartResult {
        let term = self.current_term().await;
        tracing::debug!(
            node_id = self.id,
            term,
            bytes = command.len(),
            "Rejecting command, log replication is not available"
        );
        StartResult {
            index: 0,
            term,
            is_leader: false,
        }
    }

    // ------------------------------------------------------------------
    // Inbound RPCs
    // ------------------------------------------------------------------

    /// Dispatch an inbound request to its handler.
    pub async fn handle_request(&self, request: RaftRequest) -> Result<RaftResponse> {
        if self.killed() {
            return Err(RaftError::Killed(self.id));
        }
        match request {
            RaftRequest::RequestVote(req) => self
                .handle_vote_request(req)
                .await
                .map(RaftResponse::RequestVote),
            RaftRequest::AppendEntries(req) => self
                .handle_append_entries(req)
                .await
                .map(RaftResponse::AppendEntries),
        }
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> Result<VoteResponse> {
        let mut state = self.state.write().await;
        let snapshot = state.clone();
        let response = handle_request_vote(&mut state, &req, self.id);
        // A vote must be durable before the candidate can count it.
        self.commit(&mut state, snapshot)?;
        Ok(response)
    }

    /// Handle incoming AppendEntries RPC
    ///
    /// Aborts the process if another node claims leadership of a term this
    /// node already leads.
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut state = self.state.write().await;
        let snapshot = state.clone();
        let response = match handle_append_entries(&mut state, &req, self.id) {
            Ok(response) => response,
            Err(e @ RaftError::ConflictingLeader { .. }) => {
                tracing::error!(node_id = self.id, error = %e, "Election safety violated");
                std::process::abort();
            }
            Err(e) => return Err(e),
        };
        self.commit(&mut state, snapshot)?;
        Ok(response)
    }

    // ------------------------------------------------------------------
    // Follower: election timeout detection
    // ------------------------------------------------------------------

    /// Poll the heartbeat flag once per slice while this node is a follower.
    ///
    /// Converts to candidate at once on a fresh node, otherwise when a whole
    /// window passes without the flag being set. A step-down sets the flag,
    /// so a deposed leader waits a full window before standing again.
    async fn watch_election_timeout(&self) {
        let window = self.config.election_timeout();
        let slice = self.config.election_poll_slice();
        let mut window_start = Instant::now();

        loop {
            {
                let mut state = self.state.write().await;
                if state.role != RaftRole::Follower {
                    return;
                }

                if state.timer_cleared {
                    state.timer_cleared = false;
                    window_start = Instant::now();
                } else if state.is_fresh() {
                    tracing::info!(
                        node_id = self.id,
                        term = state.current_term,
                        "No known leader, converting to candidate"
                    );
                    state.become_candidate();
                    return;
                } else if window_start.elapsed() >= window {
                    tracing::info!(
                        node_id = self.id,
                        term = state.current_term,
                        leader = ?state.leader_id,
                        timeout_ms = self.config.election_timeout_ms,
                        "Election timeout, converting to candidate"
                    );
                    state.become_candidate();
                    return;
                }
            }

            if !self.pause(slice).await {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Candidate: one election round
    // ------------------------------------------------------------------

    async fn run_election(self: &Arc<Self>) {
        let jitter = random_election_jitter(self.config.election_jitter_max_ms);
        tracing::debug!(
            node_id = self.id,
            jitter_ms = jitter.as_millis() as u64,
            "Running as candidate, electing after jitter"
        );
        if !self.pause(jitter).await {
            return;
        }

        let (term, request) = {
            let mut state = self.state.write().await;
            if state.role != RaftRole::Candidate {
                tracing::debug!(node_id = self.id, role = %state.role, "Role changed before election");
                return;
            }

            let snapshot = state.clone();
            let term = state.start_election(self.id);
            if let Err(e) = self.commit(&mut state, snapshot) {
                tracing::warn!(
                    node_id = self.id,
                    term,
                    error = %e,
                    "Failed to persist candidacy, abandoning election round"
                );
                return;
            }

            let request = VoteRequest {
                term,
                candidate_id: self.id,
                last_log_index: state.last_log_index,
                last_log_term: state.last_log_term,
            };
            (term, request)
        };

        tracing::info!(node_id = self.id, term, "Starting election");

        let round = self.fan_out(term, RaftRequest::RequestVote(request));
        let decision = tokio::select! {
            decision = round.wait() => decision,
            _ = self.shutdown.cancelled() => return,
        };
        let tally = round.tally();

        let mut state = self.state.write().await;
        match decision {
            Decision::Reached
                if state.role == RaftRole::Candidate && state.current_term == term =>
            {
                state.become_leader(self.id);
                tracing::info!(
                    node_id = self.id,
                    term,
                    votes = tally.granted + 1,
                    alive = tally.alive + 1,
                    cluster_size = self.config.cluster_size(),
                    "Became leader"
                );
            }
            Decision::Reached => {
                tracing::debug!(
                    node_id = self.id,
                    term,
                    current_term = state.current_term,
                    role = %state.role,
                    "Quorum reached for a superseded election"
                );
            }
            Decision::Lost => {
                tracing::debug!(
                    node_id = self.id,
                    term,
                    votes = tally.granted + 1,
                    needed = self.config.majority(),
                    "Election failed, not enough votes"
                );
            }
            Decision::Cancelled => {
                tracing::debug!(node_id = self.id, term, "Election abandoned after newer term");
            }
        }
    }

    // ------------------------------------------------------------------
    // Leader: heartbeat rounds
    // ------------------------------------------------------------------

    async fn lead(self: &Arc<Self>) {
        loop {
            let (term, request) = {
                let state = self.state.read().await;
                if state.role != RaftRole::Leader || self.killed() {
                    return;
                }
                let request = AppendEntriesRequest {
                    term: state.current_term,
                    leader_id: self.id,
                    prev_log_index: state.last_log_index,
                    prev_log_term: state.last_log_term,
                    leader_commit: state.commit_index,
                };
                (state.current_term, request)
            };

            let next_round = Instant::now() + self.config.heartbeat_interval();
            let round = self.fan_out(term, RaftRequest::AppendEntries(request));
            let decision = tokio::select! {
                decision = round.wait() => decision,
                _ = self.shutdown.cancelled() => return,
            };

            if decision == Decision::Lost {
                let tally = round.tally();
                let mut state = self.state.write().await;
                if state.role == RaftRole::Leader && state.current_term == term {
                    tracing::warn!(
                        node_id = self.id,
                        term,
                        acks = tally.granted + 1,
                        alive = tally.alive + 1,
                        cluster_size = self.config.cluster_size(),
                        "Lost contact with a quorum, stepping down to candidate"
                    );
                    state.become_candidate();
                }
                return;
            }

            tracing::trace!(node_id = self.id, term, ?decision, "Heartbeat round finished");

            if !self.pause_until(next_round).await {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound calls
    // ------------------------------------------------------------------

    /// Send `request` to every peer concurrently. Each reply is folded into
    /// the returned round as it arrives.
    fn fan_out(self: &Arc<Self>, term: u64, request: RaftRequest) -> Arc<QuorumCall> {
        let round = Arc::new(QuorumCall::new(
            self.config.peers.len(),
            self.config.peer_quorum(),
        ));

        for &peer in &self.config.peers {
            let node = self.clone();
            let round = round.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let reply = node.call_peer(peer, request).await;
                node.on_response(peer, term, reply, &round).await;
            });
        }

        round
    }

    async fn call_peer(
        &self,
        peer: u64,
        request: RaftRequest,
    ) -> std::result::Result<RaftResponse, TransportError> {
        let method = request.method();
        let wants_vote = matches!(request, RaftRequest::RequestVote(_));

        match timeout(self.config.rpc_timeout(), self.transport.call(peer, request)).await {
            Ok(Ok(response)) => {
                if wants_vote == matches!(response, RaftResponse::RequestVote(_)) {
                    Ok(response)
                } else {
                    Err(TransportError::UnexpectedResponse { peer, method })
                }
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout(peer)),
        }
    }

    /// Fold one reply of a round issued in `term` into `round`.
    async fn on_response(
        &self,
        peer: u64,
        term: u64,
        reply: std::result::Result<RaftResponse, TransportError>,
        round: &QuorumCall,
    ) {
        let response = match reply {
            Ok(response) => response,
            Err(e) => {
                tracing::trace!(node_id = self.id, peer_id = peer, error = %e, "RPC failed");
                round.record(Outcome::Unreachable);
                return;
            }
        };

        let (reply_term, positive, round_role) = match &response {
            RaftResponse::RequestVote(resp) => (resp.term, resp.vote_granted, RaftRole::Candidate),
            RaftResponse::AppendEntries(resp) => (resp.term, resp.success, RaftRole::Leader),
        };

        let mut state = self.state.write().await;
        let accepted = match self.observe_reply_term(&mut state, peer, reply_term) {
            Ok(TermCheck::SteppedDown) => {
                round.cancel();
                return;
            }
            Ok(TermCheck::Stale) => false,
            Ok(TermCheck::Current) => {
                positive && state.role == round_role && state.current_term == term
            }
            Err(e) => {
                tracing::warn!(
                    node_id = self.id,
                    peer_id = peer,
                    term = reply_term,
                    error = %e,
                    "Failed to persist newer term, discarding reply"
                );
                false
            }
        };

        if accepted && round_role == RaftRole::Candidate {
            tracing::debug!(node_id = self.id, peer_id = peer, term, "Received vote");
        }
        round.record(Outcome::Replied { accepted });
    }

    /// Apply the term rules to a reply. Stepping down is persisted here; if
    /// the save fails the node keeps its old term and role.
    fn observe_reply_term(
        &self,
        state: &mut RaftState,
        peer: u64,
        term: u64,
    ) -> Result<TermCheck> {
        let snapshot = state.clone();
        let check = state.check_term(term);
        if check == TermCheck::SteppedDown {
            self.commit(state, snapshot)?;
            tracing::info!(
                node_id = self.id,
                peer_id = peer,
                term,
                "Saw newer term in reply, stepping down to follower"
            );
        }
        Ok(check)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Save term and vote if they differ from `snapshot`. When the save
    /// fails, `state` is put back to `snapshot` so nothing unsaved is ever
    /// acted on or repeated.
    fn commit(&self, state: &mut RaftState, snapshot: RaftState) -> Result<()> {
        let current = state.persistent();
        if current == snapshot.persistent() {
            return Ok(());
        }
        if let Err(e) = current.encode().and_then(|data| self.persister.save(&data)) {
            *state = snapshot;
            return Err(e);
        }
        Ok(())
    }

    /// Sleep for `duration`. Returns false if the node was killed meanwhile.
    async fn pause(&self, duration: Duration) -> bool {
        self.pause_until(Instant::now() + duration).await
    }

    async fn pause_until(&self, deadline: Instant) -> bool {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => !self.killed(),
            _ = self.shutdown.cancelled() => false,
        }
    }
}
