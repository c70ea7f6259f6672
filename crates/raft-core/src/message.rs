//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, carried by raft-server transports
//! what: VoteRequest, VoteResponse, AppendEntries and their envelope enum
//!
//! field names are the wire contract between servers; renaming one is a protocol break.

use serde::{Deserialize, Serialize};

use crate::LogEntry;

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Response to a vote request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    /// Index of the last entry this request covers
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Response to AppendEntries
///
/// On success `match_index` is the last index the follower now shares with the
/// leader. On a consistency failure it is the highest index the follower could
/// still match, so the leader can jump `next_index` back in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl RaftMessage {
    /// Term carried by the message, whatever its kind
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::VoteRequest(m) => m.term,
            RaftMessage::VoteResponse(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesResponse(m) => m.term,
        }
    }
}

impl From<VoteRequest> for RaftMessage {
    fn from(m: VoteRequest) -> Self {
        RaftMessage::VoteRequest(m)
    }
}

impl From<VoteResponse> for RaftMessage {
    fn from(m: VoteResponse) -> Self {
        RaftMessage::VoteResponse(m)
    }
}

impl From<AppendEntriesRequest> for RaftMessage {
    fn from(m: AppendEntriesRequest) -> Self {
        RaftMessage::AppendEntries(m)
    }
}

impl From<AppendEntriesResponse> for RaftMessage {
    fn from(m: AppendEntriesResponse) -> Self {
        RaftMessage::AppendEntriesResponse(m)
    }
}
