use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("State codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Node {leader_id} claims leadership of term {term}, which this node already leads")]
    ConflictingLeader { term: u64, leader_id: u64 },

    #[error("Node {0} has been killed")]
    Killed(u64),
}

pub type Result<T> = std::result::Result<T, RaftError>;
