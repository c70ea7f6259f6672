//! # state
//!
//! why: name exactly what must survive a crash
//! relations: produced by node.rs after mutations, written and read by raft-storage
//! what: PersistentState (term, vote, full log)

use serde::{Deserialize, Serialize};

use crate::LogEntry;

/// Durable part of a server's state, written as one blob after every change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,
}

impl PersistentState {
    pub fn new(current_term: u64, voted_for: Option<u64>, log: Vec<LogEntry>) -> Self {
        Self {
            current_term,
            voted_for,
            log,
        }
    }

    /// Whether this is the state of a server that never ran
    pub fn is_initial(&self) -> bool {
        self.current_term == 0 && self.voted_for.is_none() && self.log.is_empty()
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }
}
