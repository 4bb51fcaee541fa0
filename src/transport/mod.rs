pub mod local;

use async_trait::async_trait;
use thiserror::Error;

use crate::raft::rpc::{RaftRequest, RaftResponse};

pub use local::{LocalNetwork, LocalTransport, NetworkConditions};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer {0} is unreachable")]
    Unreachable(u64),

    #[error("Message to peer {0} was lost")]
    Dropped(u64),

    #[error("Call to peer {0} timed out")]
    Timeout(u64),

    #[error("Peer {peer} answered {method} with the wrong response kind")]
    UnexpectedResponse { peer: u64, method: &'static str },

    #[error("Peer {peer} failed to handle the request: {reason}")]
    Remote { peer: u64, reason: String },
}

/// Invokes an RPC method on a peer.
///
/// Implementations may lose, delay or duplicate messages, but every call must
/// eventually return. Any `Err` is treated as "peer not reachable this round".
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(
        &self,
        peer: u64,
        request: RaftRequest,
    ) -> std::result::Result<RaftResponse, TransportError>;
}
