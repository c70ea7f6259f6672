//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-server's async runtime, persisted via raft-storage
//! what: state machine, election logic, log management, message types, config

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod state;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use log::LogEntry;
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, RaftMessage, VoteRequest, VoteResponse,
};
pub use node::{validate_cluster, NodeState, RaftNode};
pub use state::PersistentState;
