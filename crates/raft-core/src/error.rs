//! # error
//!
//! why: give callers a typed reason when the consensus core refuses an operation
//! relations: returned by node.rs and config.rs, wrapped by raft-server
//! what: RaftError enum and Result alias

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    /// Submission reached a server that does not believe it is leader
    #[error("not the leader, last known leader is {leader_hint:?}")]
    NotLeader { leader_hint: Option<u64> },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid cluster: {0}")]
    InvalidCluster(String),

    /// Restored durable state breaks a log invariant
    #[error("corrupt persisted state: {0}")]
    CorruptState(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
