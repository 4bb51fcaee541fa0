use serde::Serialize;

use crate::persist::PersistentState;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RaftRole::Follower => "follower",
            RaftRole::Candidate => "candidate",
            RaftRole::Leader => "leader",
        };
        f.pad(name)
    }
}

/// Result of comparing an incoming message term with the local term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermCheck {
    /// The message belongs to an older term and must be rejected.
    Stale,
    /// The message carried a newer term; this node has adopted it as a follower.
    SteppedDown,
    /// Same term, term-local rules apply.
    Current,
}

/// Term, role and vote of a single peer.
///
/// All mutation goes through the owning `RaftNode`'s write lock, so each
/// method here runs as part of one atomic read-decide-write step.
///
/// # Election Safety
///
/// At most one leader can be elected in a given term:
/// - `voted_for` is only ever set while it is `None` (or already equal to the
///   same candidate) within a term, and only cleared when the term advances
/// - a candidate votes for itself in the same step that bumps its term
/// - leadership requires a strict majority of the full membership
///
/// `voted_for` survives an election timeout: a follower that
/// gave its vote away in term T and then times out keeps that vote until it
/// starts its own candidacy in T+1.
#[derive(Debug, Clone)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<u64>,

    // Log bookkeeping (stays at zero until log replication exists)
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,

    // Current role
    pub role: RaftRole,

    // Leader recognized for the current term (if any)
    pub leader_id: Option<u64>,

    /// Set whenever a valid heartbeat is accepted, a vote is granted, or a
    /// newer term is adopted. The election timeout detector consumes it.
    pub timer_cleared: bool,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            last_log_term: 0,
            role: RaftRole::Follower,
            leader_id: None,
            timer_cleared: false,
        }
    }

    /// Rebuild volatile state around a persisted term and vote.
    pub fn restore(persisted: &PersistentState) -> Self {
        Self {
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            ..Self::new()
        }
    }

    pub fn persistent(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    /// True when a message from `term` must be rejected without side effects.
    pub fn is_stale(&self, term: u64) -> bool {
        term < self.current_term
    }

    /// Adopt `term` if it is newer than ours: become a follower with no vote
    /// and no known leader for the new term, and count the contact as a
    /// heartbeat so the timeout window restarts.
    pub fn step_down_if_newer(&mut self, term: u64) -> bool {
        if term <= self.current_term {
            return false;
        }
        self.current_term = term;
        self.role = RaftRole::Follower;
        self.voted_for = None;
        self.leader_id = None;
        self.timer_cleared = true;
        true
    }

    /// Apply the stale check and then the newer-term check, in that order.
    pub fn check_term(&mut self, term: u64) -> TermCheck {
        if self.is_stale(term) {
            TermCheck::Stale
        } else if self.step_down_if_newer(term) {
            TermCheck::SteppedDown
        } else {
            TermCheck::Current
        }
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        // Candidate's log is up-to-date if:
        // 1. Their last term is greater, OR
        // 2. Terms are equal and their index is >= ours
        last_log_term > self.last_log_term
            || (last_log_term == self.last_log_term && last_log_index >= self.last_log_index)
    }

    /// Whether this node has cast a vote or recognized a leader this term.
    pub fn has_contact(&self) -> bool {
        self.voted_for.is_some() || self.leader_id.is_some()
    }

    /// True for a node that has never seen a term, cast a vote or followed a
    /// leader. Such a node stands for election without waiting a full window.
    pub fn is_fresh(&self) -> bool {
        self.current_term == 0 && !self.has_contact()
    }

    /// Accept `leader_id` as the leader of the current term.
    pub fn follow(&mut self, leader_id: u64) {
        self.role = RaftRole::Follower;
        self.leader_id = Some(leader_id);
        self.timer_cleared = true;
    }

    /// Transition to candidate state without starting an election yet.
    pub fn become_candidate(&mut self) {
        self.role = RaftRole::Candidate;
        self.leader_id = None;
        self.timer_cleared = false;
    }

    /// Open a new election round: bump the term and vote for ourselves.
    /// Returns the new term.
    pub fn start_election(&mut self, my_id: u64) -> u64 {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.leader_id = None;
        self.current_term
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: u64) {
        self.role = RaftRole::Leader;
        self.voted_for = Some(my_id);
        self.leader_id = Some(my_id);
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
