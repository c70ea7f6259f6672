//! # apply
//!
//! why: hand committed commands to the application in log order, once each
//! relations: fed by server.rs whenever the commit index moves
//! what: ApplyMsg and the apply loop

use std::sync::Arc;

use raft_core::LogEntry;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::server::Inner;

/// A committed command delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub index: u64,
    /// Term the entry was created in; matches the pair returned by `Raft::start`
    pub term: u64,
    pub command: Vec<u8>,
}

impl From<LogEntry> for ApplyMsg {
    fn from(entry: LogEntry) -> Self {
        Self {
            index: entry.index,
            term: entry.term,
            command: entry.command,
        }
    }
}

/// Sole consumer of the committed prefix. Runs until shutdown or until the
/// application drops its receiver; a stopped server delivers nothing further.
pub(crate) async fn run(inner: Arc<Inner>, apply_tx: UnboundedSender<ApplyMsg>) {
    loop {
        let entries = {
            let mut core = inner.core.lock();
            if core.stopped {
                return;
            }
            core.node.get_entries_to_apply()
        };
        for entry in entries {
            let index = entry.index;
            if apply_tx.send(ApplyMsg::from(entry)).is_err() {
                warn!(node_id = inner.id, index, "apply channel closed, stopping delivery");
                return;
            }
            debug!(node_id = inner.id, index, "applied entry");
        }

        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = inner.apply_ready.notified() => {}
        }
    }
}
