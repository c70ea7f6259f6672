//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via raft-storage
//! what: LogEntry struct, up-to-date comparison, conflict lookup helpers

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }
}

/// Whether a candidate log ending at (`candidate_last_term`, `candidate_last_index`)
/// is at least as up to date as a log ending at (`our_last_term`, `our_last_index`).
///
/// Terms are compared first; the longer log wins only when the terms tie.
pub fn is_at_least_as_up_to_date(
    candidate_last_term: u64,
    candidate_last_index: u64,
    our_last_term: u64,
    our_last_index: u64,
) -> bool {
    candidate_last_term > our_last_term
        || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
}

/// First index of the run of entries sharing the term of the entry at `index`.
///
/// `log` must be dense and 1-indexed; returns `index` itself when it is out of range.
pub(crate) fn first_index_of_term_run(log: &[LogEntry], index: u64) -> u64 {
    if index == 0 || index as usize > log.len() {
        return index;
    }
    let term = log[(index - 1) as usize].term;
    let mut first = index;
    while first > 1 && log[(first - 2) as usize].term == term {
        first -= 1;
    }
    first
}
