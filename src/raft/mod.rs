pub mod node;
pub mod quorum;
pub mod rpc;
pub mod state;
pub mod timer;

pub use node::{ApplyMsg, NodeStatus, RaftNode, StartResult};
pub use quorum::{Decision, Outcome, QuorumCall, Tally};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RaftRequest, RaftResponse, VoteRequest,
    VoteResponse,
};
pub use state::{RaftRole, RaftState, TermCheck};
