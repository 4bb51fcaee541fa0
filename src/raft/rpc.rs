use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::state::{RaftRole, RaftState, TermCheck};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Heartbeat. Carries no entries until log replication exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
}

/// The two RPC methods a peer exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    RequestVote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
}

impl RaftRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RaftRequest::RequestVote(_) => "Raft.RequestVote",
            RaftRequest::AppendEntries(_) => "Raft.AppendEntries",
        }
    }

    pub fn term(&self) -> u64 {
        match self {
            RaftRequest::RequestVote(req) => req.term,
            RaftRequest::AppendEntries(req) => req.term,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    RequestVote(VoteResponse),
    AppendEntries(AppendEntriesResponse),
}

impl RaftResponse {
    pub fn term(&self) -> u64 {
        match self {
            RaftResponse::RequestVote(resp) => resp.term,
            RaftResponse::AppendEntries(resp) => resp.term,
        }
    }
}

/// Handle RequestVote RPC
///
/// A newer term is adopted first; the vote is then decided by the same
/// rule as for the current term, so a node never grants two different
/// votes in one term.
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest, my_id: u64) -> VoteResponse {
    match state.check_term(req.term) {
        TermCheck::Stale => {
            tracing::debug!(
                node_id = my_id,
                candidate = req.candidate_id,
                term = req.term,
                current_term = state.current_term,
                "Discarding stale RequestVote"
            );
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }
        TermCheck::SteppedDown => {
            tracing::info!(
                node_id = my_id,
                candidate = req.candidate_id,
                term = req.term,
                "Adopted newer term from candidate"
            );
        }
        TermCheck::Current => {}
    }

    let vote_granted = if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        state.voted_for = Some(req.candidate_id);
        state.timer_cleared = true;
        // A candidate that has not opened its own round yet backs this one instead.
        if state.role == RaftRole::Candidate {
            state.role = RaftRole::Follower;
        }
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        voted_for = ?state.voted_for,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle AppendEntries RPC (heartbeat)
///
/// Returns `RaftError::ConflictingLeader` if this node is itself the leader
/// of the request's term: two leaders in one term means election safety has
/// already been broken.
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
    my_id: u64,
) -> Result<AppendEntriesResponse> {
    match state.check_term(req.term) {
        TermCheck::Stale => {
            tracing::debug!(
                node_id = my_id,
                leader = req.leader_id,
                term = req.term,
                current_term = state.current_term,
                "Discarding stale heartbeat"
            );
            return Ok(AppendEntriesResponse {
                term: state.current_term,
                success: false,
            });
        }
        TermCheck::SteppedDown => {
            tracing::info!(
                node_id = my_id,
                leader = req.leader_id,
                term = req.term,
                "Adopted newer term from leader"
            );
        }
        TermCheck::Current => {}
    }

    match state.role {
        RaftRole::Leader => {
            return Err(RaftError::ConflictingLeader {
                term: req.term,
                leader_id: req.leader_id,
            });
        }
        RaftRole::Candidate => {
            tracing::info!(
                node_id = my_id,
                leader = req.leader_id,
                term = req.term,
                "Another leader won this term, stepping down"
            );
        }
        RaftRole::Follower => {}
    }
    state.follow(req.leader_id);

    if req.leader_commit > state.commit_index {
        state.commit_index = std::cmp::min(req.leader_commit, state.last_log_index);
    }

    Ok(AppendEntriesResponse {
        term: state.current_term,
        success: true,
    })
}
