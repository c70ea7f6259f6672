//! # network
//!
//! why: run a whole cluster inside one process with controllable faults
//! relations: implements transport.rs, dispatches into server.rs handlers
//! what: LocalNetwork (registry + fault switches) and the per-server LocalTransport
//!
//! every request and reply goes through the json wire encoding, so servers only
//! ever see what a real peer could have sent them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, RaftMessage, VoteRequest, VoteResponse,
};

use tracing::trace;

use crate::error::TransportError;
use crate::server::Raft;
use crate::transport::Transport;

/// Longest extra delay an unreliable network adds to a request
const MAX_UNRELIABLE_DELAY_MS: u64 = 27;
/// One message in `LOSS_DENOMINATOR` is lost on an unreliable network
const LOSS_DENOMINATOR: u32 = 10;

#[derive(Debug, Default)]
struct NetState {
    servers: HashMap<u64, Raft>,
    disconnected: HashSet<u64>,
    unreliable: bool,
    rpc_count: u64,
}

impl NetState {
    fn link_up(&self, from: u64, to: u64) -> bool {
        !self.disconnected.contains(&from) && !self.disconnected.contains(&to)
    }
}

/// In-process network shared by every server of a test cluster
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for server `id` to reach its peers through this network
    pub fn transport(&self, id: u64) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            id,
            network: Arc::downgrade(&self.state),
        })
    }

    /// Make `raft` reachable as server `id`, replacing any previous instance
    pub fn register(&self, id: u64, raft: Raft) {
        self.state.lock().servers.insert(id, raft);
    }

    pub fn unregister(&self, id: u64) -> Option<Raft> {
        self.state.lock().servers.remove(&id)
    }

    pub fn connect(&self, id: u64) {
        self.state.lock().disconnected.remove(&id);
    }

    /// Cut every link to and from `id`, including replies already in flight
    pub fn disconnect(&self, id: u64) {
        self.state.lock().disconnected.insert(id);
    }

    pub fn is_connected(&self, id: u64) -> bool {
        !self.state.lock().disconnected.contains(&id)
    }

    /// An unreliable network delays requests and loses some requests and replies
    pub fn set_reliable(&self, reliable: bool) {
        self.state.lock().unreliable = !reliable;
    }

    /// Requests attempted so far, delivered or not
    pub fn rpc_count(&self) -> u64 {
        self.state.lock().rpc_count
    }

    async fn call(&self, from: u64, to: u64, msg: RaftMessage) -> Result<RaftMessage, TransportError> {
        let (target, unreliable) = {
            let mut state = self.state.lock();
            state.rpc_count += 1;
            if !state.link_up(from, to) {
                return Err(TransportError::Unreachable(to));
            }
            let target = state
                .servers
                .get(&to)
                .cloned()
                .ok_or(TransportError::Unreachable(to))?;
            (target, state.unreliable)
        };

        if unreliable {
            let (delay, lost) = {
                let mut rng = rand::thread_rng();
                (
                    rng.gen_range(0..=MAX_UNRELIABLE_DELAY_MS),
                    rng.gen_ratio(1, LOSS_DENOMINATOR),
                )
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if lost {
                trace!(from, to, term = msg.term(), "request lost");
                return Err(TransportError::Dropped);
            }
        }

        let reply = match wire_roundtrip(&msg)? {
            RaftMessage::VoteRequest(req) => target.handle_request_vote(req).map(RaftMessage::from),
            RaftMessage::AppendEntries(req) => {
                target.handle_append_entries(req).map(RaftMessage::from)
            }
            other => {
                return Err(TransportError::Remote(format!("not a request: {other:?}")));
            }
        }
        .map_err(|e| TransportError::Remote(e.to_string()))?;

        // the remote acted, but the reply may still never arrive
        if unreliable && rand::thread_rng().gen_ratio(1, LOSS_DENOMINATOR) {
            trace!(from, to, term = reply.term(), "reply lost");
            return Err(TransportError::Dropped);
        }
        if !self.state.lock().link_up(from, to) {
            return Err(TransportError::Unreachable(to));
        }
        wire_roundtrip(&reply)
    }
}

fn wire_roundtrip(msg: &RaftMessage) -> Result<RaftMessage, TransportError> {
    let bytes = serde_json::to_vec(msg).map_err(|e| TransportError::Remote(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Remote(e.to_string()))
}

/// Registered servers own their transport, so it only holds the network weakly
struct LocalTransport {
    id: u64,
    network: Weak<Mutex<NetState>>,
}

impl LocalTransport {
    fn network(&self, target: u64) -> Result<LocalNetwork, TransportError> {
        self.network
            .upgrade()
            .map(|state| LocalNetwork { state })
            .ok_or(TransportError::Unreachable(target))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        target: u64,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        match self.network(target)?.call(self.id, target, req.into()).await? {
            RaftMessage::VoteResponse(resp) => Ok(resp),
            other => Err(TransportError::Remote(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        match self.network(target)?.call(self.id, target, req.into()).await? {
            RaftMessage::AppendEntriesResponse(resp) => Ok(resp),
            other => Err(TransportError::Remote(format!("unexpected reply: {other:?}"))),
        }
    }
}
