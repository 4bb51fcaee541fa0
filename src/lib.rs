pub mod cluster;
pub mod config;
pub mod error;
pub mod persist;
pub mod raft;
pub mod transport;
