//! # replication
//!
//! why: turn timer expiries and leader ticks into elections and AppendEntries rounds
//! relations: background half of server.rs, talks to peers through transport.rs
//! what: role loop, election fan-out, replication driver
//!
//! every outbound call runs in its own task so one slow peer never holds up the rest.
//! replies are folded back under the core lock; stale ones are ignored by raft-core.

use std::sync::Arc;
use std::time::Duration;

use raft_core::{AppendEntriesRequest, NodeState, VoteRequest};
use tracing::{debug, info, trace};

use crate::server::Inner;

impl Inner {
    /// Follower/candidate: wait for the election deadline. Leader: replicate every tick.
    pub(crate) async fn run_role_loop(self: Arc<Self>) {
        info!(node_id = self.id, "role loop started");
        loop {
            let (role, deadline) = {
                let core = self.core.lock();
                if core.stopped {
                    break;
                }
                (core.node.state, core.timer.deadline())
            };

            if role == NodeState::Leader {
                self.broadcast_append_entries();
                let tick = Duration::from_millis(self.config.heartbeat_interval);
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                    _ = self.wake.notified() => {}
                }
            } else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => self.start_election(),
                    _ = self.wake.notified() => {}
                }
            }
        }
        debug!(node_id = self.id, "role loop stopped");
    }

    fn start_election(self: &Arc<Self>) {
        let req = {
            let mut core = self.core.lock();
            // a heartbeat or granted vote may have re-armed the timer meanwhile
            if core.stopped || core.node.is_leader() || !core.timer.is_expired() {
                return;
            }
            let req = core.node.start_election();
            if self.persist(&mut core).is_err() {
                return;
            }
            core.timer.reset();
            if core.node.is_leader() {
                // lone member, the next loop turn starts leading
                return;
            }
            req
        };

        for &peer in &self.peers {
            let inner = Arc::clone(self);
            let req = req.clone();
            self.spawn(async move { inner.request_vote(peer, req).await });
        }
    }

    async fn request_vote(&self, peer: u64, req: VoteRequest) {
        let term = req.term;
        let resp = match self.transport.request_vote(peer, req).await {
            Ok(resp) => resp,
            Err(e) => {
                trace!(node_id = self.id, peer_id = peer, term, error = %e, "RequestVote failed");
                return;
            }
        };

        let won = {
            let mut core = self.core.lock();
            if core.stopped {
                return;
            }
            let was_leader = core.node.is_leader();
            let won = core.node.handle_vote_response(peer, &resp);
            if self.persist(&mut core).is_err() {
                return;
            }
            if was_leader && !core.node.is_leader() {
                core.timer.reset();
            }
            won
        };

        if won {
            // assert leadership before anyone else times out
            self.wake.notify_one();
        }
    }

    /// Send every peer its next AppendEntries, a heartbeat when it is caught up
    pub(crate) fn broadcast_append_entries(self: &Arc<Self>) {
        let requests: Vec<(u64, AppendEntriesRequest)> = {
            let core = self.core.lock();
            if core.stopped || !core.node.is_leader() {
                return;
            }
            self.peers
                .iter()
                .filter_map(|&peer| core.node.create_append_entries(peer).map(|req| (peer, req)))
                .collect()
        };

        for (peer, req) in requests {
            let inner = Arc::clone(self);
            self.spawn(async move { inner.replicate(peer, req).await });
        }
    }

    async fn replicate(&self, peer: u64, req: AppendEntriesRequest) {
        let sent = req.entries.len();
        let heartbeat = req.is_heartbeat();
        let resp = match self.transport.append_entries(peer, req).await {
            Ok(resp) => resp,
            Err(e) => {
                trace!(node_id = self.id, peer_id = peer, sent, heartbeat, error = %e, "AppendEntries failed");
                return;
            }
        };

        let (committed, leading) = {
            let mut core = self.core.lock();
            if core.stopped {
                return;
            }
            let was_leader = core.node.is_leader();
            let committed = core.node.handle_append_entries_response(peer, &resp);
            if self.persist(&mut core).is_err() {
                return;
            }
            let leading = core.node.is_leader();
            if was_leader && !leading {
                // give the new leader a full timeout to reach us
                core.timer.reset();
            }
            (committed, leading)
        };

        if committed {
            self.apply_ready.notify_one();
        }
        if !leading {
            self.wake.notify_one();
        }
    }
}
