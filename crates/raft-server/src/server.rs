//! # server
//!
//! why: run one consensus member: guard its state, persist it, expose its public surface
//! relations: drives raft-core's RaftNode, writes through raft-storage, calls out via transport.rs
//! what: Raft handle, Status, the shared Inner/Core state and inbound RPC handlers
//!
//! all mutable state lives in `Core` behind a single mutex. handlers and background
//! tasks take the lock, mutate, persist if needed and release it before any network
//! call or await. a failed persist marks the server stopped in the same critical
//! section, so no reply depending on that write is ever released.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, NodeState, RaftConfig, RaftNode, VoteRequest,
    VoteResponse,
};
use raft_storage::Storage;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::apply::{self, ApplyMsg};
use crate::error::{Result, ServerError};
use crate::timer::ElectionTimer;
use crate::transport::Transport;

pub(crate) struct Core {
    pub(crate) node: RaftNode,
    storage: Box<dyn Storage>,
    pub(crate) timer: ElectionTimer,
    pub(crate) stopped: bool,
}

pub(crate) struct Inner {
    pub(crate) id: u64,
    pub(crate) peers: Vec<u64>,
    pub(crate) config: RaftConfig,
    pub(crate) core: Mutex<Core>,
    pub(crate) transport: Arc<dyn Transport>,
    /// role loop: timer reset, role change or new entries to replicate
    pub(crate) wake: Notify,
    /// apply loop: commit index moved
    pub(crate) apply_ready: Notify,
    pub(crate) shutdown: CancellationToken,
}

impl Inner {
    /// Write durable state if term, vote or log changed.
    ///
    /// Must be called before releasing the lock on any path that hands out a
    /// reply or starts an election. A failed write stops the server for good.
    pub(crate) fn persist(&self, core: &mut Core) -> Result<()> {
        if core.stopped {
            return Err(ServerError::Stopped);
        }
        let Some(state) = core.node.take_persistent_state() else {
            return Ok(());
        };
        if let Err(e) = core.storage.save(&state) {
            error!(
                node_id = self.id,
                term = state.current_term,
                error = %e,
                "failed to persist state, stopping server"
            );
            core.stopped = true;
            self.shutdown.cancel();
            return Err(e.into());
        }
        Ok(())
    }

    /// Spawn a background task that is dropped on shutdown
    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = fut => {}
            }
        });
    }
}

/// Point-in-time view of a server, for diagnostics and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: u64,
    pub role: NodeState,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub stopped: bool,
}

/// Handle to a running consensus member. Cheap to clone.
#[derive(Clone)]
pub struct Raft {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for Raft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Raft")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl Raft {
    /// Restore state from `storage` and start the role and apply loops.
    ///
    /// Returns without blocking; must be called inside a tokio runtime.
    /// Committed entries are delivered on `apply_tx` in index order.
    pub fn new(
        id: u64,
        cluster_nodes: Vec<u64>,
        config: RaftConfig,
        storage: Box<dyn Storage>,
        transport: Arc<dyn Transport>,
        apply_tx: UnboundedSender<ApplyMsg>,
    ) -> Result<Self> {
        let persisted = storage.load()?;
        let node = RaftNode::restore(id, cluster_nodes, config.clone(), persisted)?;
        let peers = node.peers().collect();
        let timer = ElectionTimer::new(config.election_timeout_min, config.election_timeout_max);

        info!(
            node_id = id,
            term = node.current_term,
            voted_for = ?node.voted_for,
            last_log_index = node.last_log_index(),
            "starting raft server"
        );

        let inner = Arc::new(Inner {
            id,
            peers,
            config,
            core: Mutex::new(Core {
                node,
                storage,
                timer,
                stopped: false,
            }),
            transport,
            wake: Notify::new(),
            apply_ready: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&inner).run_role_loop());
        tokio::spawn(apply::run(Arc::clone(&inner), apply_tx));

        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current term and whether this server believes it is leader
    pub fn get_state(&self) -> (u64, bool) {
        let core = self.inner.core.lock();
        (core.node.current_term, core.node.is_leader())
    }

    pub fn status(&self) -> Status {
        let core = self.inner.core.lock();
        Status {
            id: self.inner.id,
            role: core.node.state,
            term: core.node.current_term,
            leader_id: core.node.leader_id,
            last_log_index: core.node.last_log_index(),
            commit_index: core.node.commit_index,
            last_applied: core.node.last_applied,
            stopped: core.stopped,
        }
    }

    /// Submit a command. Returns its provisional (index, term) without waiting for
    /// it to commit; it counts only once delivered through the apply channel.
    pub fn start(&self, command: Vec<u8>) -> Result<(u64, u64)> {
        let inner = &self.inner;
        let (entry, committed) = {
            let mut core = inner.core.lock();
            if core.stopped {
                return Err(ServerError::Stopped);
            }
            let commit = core.node.commit_index;
            let entry = core.node.append_entry(command)?;
            inner.persist(&mut core)?;
            (entry, core.node.commit_index > commit)
        };

        debug!(node_id = inner.id, index = entry.index, term = entry.term, "accepted command");
        // replicate now rather than on the next tick
        inner.wake.notify_one();
        if committed {
            inner.apply_ready.notify_one();
        }
        Ok((entry.index, entry.term))
    }

    /// Stop all background activity. Later RPCs and submissions fail with `Stopped`.
    pub fn kill(&self) {
        let mut core = self.inner.core.lock();
        if !core.stopped {
            info!(node_id = self.inner.id, term = core.node.current_term, "stopping raft server");
        }
        core.stopped = true;
        self.inner.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.core.lock().stopped
    }

    /// Inbound RequestVote
    pub fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if core.stopped {
            return Err(ServerError::Stopped);
        }
        let role = core.node.state;

        let (resp, reset) = core.node.handle_vote_request(&req);
        inner.persist(&mut core)?;
        let role_changed = core.node.state != role;
        // a deposed leader's deadline lapsed while it was leading
        if reset || (role_changed && role == NodeState::Leader) {
            core.timer.reset();
        }
        drop(core);

        if reset || role_changed {
            inner.wake.notify_one();
        }
        Ok(resp)
    }

    /// Inbound AppendEntries
    pub fn handle_append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if core.stopped {
            return Err(ServerError::Stopped);
        }
        let role = core.node.state;
        let commit = core.node.commit_index;

        let (resp, reset) = core.node.handle_append_entries(&req);
        inner.persist(&mut core)?;
        if reset {
            core.timer.reset();
        }
        let role_changed = core.node.state != role;
        let committed = core.node.commit_index > commit;
        drop(core);

        if reset || role_changed {
            inner.wake.notify_one();
        }
        if committed {
            inner.apply_ready.notify_one();
        }
        Ok(resp)
    }
}
