//! # error
//!
//! why: separate recoverable transport failures from errors a caller must act on
//! relations: TransportError comes from transport.rs / network.rs, ServerError from server.rs
//! what: TransportError, ServerError, Result alias

use raft_core::RaftError;
use raft_storage::StorageError;
use thiserror::Error;

/// An outbound call that did not produce a reply.
///
/// The remote may still have acted on the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(u64),

    #[error("message dropped in transit")]
    Dropped,

    #[error("remote failed to handle request: {0}")]
    Remote(String),
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Raft(#[from] RaftError),

    /// Durable state could not be written; the server has stopped
    #[error("persistence failed: {0}")]
    Storage(#[from] StorageError),

    #[error("server is stopped")]
    Stopped,
}

impl ServerError {
    /// Best-known leader when a submission was refused for not leading
    pub fn leader_hint(&self) -> Option<u64> {
        match self {
            ServerError::Raft(RaftError::NotLeader { leader_hint }) => *leader_hint,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
