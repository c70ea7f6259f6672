//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management, state.rs for durability
//! what: NodeState enum, RaftNode struct, election, replication and commit rules
//!
//! the node never touches clocks, threads or sockets. every handler takes a message,
//! mutates the node and returns the reply together with the side effects the caller
//! must carry out (reset the election timer, deliver newly committed entries).
//! whenever term, vote or log change the node flags itself dirty; the caller must
//! write `take_persistent_state()` to durable storage before releasing any reply.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::log::{first_index_of_term_run, is_at_least_as_up_to_date, LogEntry};
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::state::PersistentState;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: u64,
    /// Every voting member, this node included, in the agreed order
    pub cluster_nodes: Vec<u64>,
    pub config: RaftConfig,

    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<u64>,
    /// Replicated log, dense and 1-indexed (`log[i].index == i + 1`)
    pub log: Vec<LogEntry>,

    pub commit_index: u64,
    pub last_applied: u64,

    // leader only, rebuilt on every election win
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    /// Voters that granted us their vote in the current election
    pub votes_received: Vec<u64>,
    /// Leader we last accepted AppendEntries from, or ourselves while leading
    pub leader_id: Option<u64>,

    persist_pending: bool,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: u64, cluster_nodes: Vec<u64>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: u64, cluster_nodes: Vec<u64>, config: RaftConfig) -> Self {
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: Vec::new(),
            leader_id: None,
            persist_pending: false,
        }
    }

    /// Rebuild a node from durable state after a restart, validating its inputs.
    ///
    /// Commit and apply cursors start at zero and are re-learned from the leader.
    pub fn restore(
        id: u64,
        cluster_nodes: Vec<u64>,
        config: RaftConfig,
        persisted: PersistentState,
    ) -> Result<Self> {
        config.validate()?;
        validate_cluster(id, &cluster_nodes)?;
        for (i, entry) in persisted.log.iter().enumerate() {
            if entry.index != i as u64 + 1 {
                return Err(RaftError::CorruptState(format!(
                    "log position {} holds index {}",
                    i + 1,
                    entry.index
                )));
            }
            if entry.term > persisted.current_term {
                return Err(RaftError::CorruptState(format!(
                    "entry {} has term {} beyond current term {}",
                    entry.index, entry.term, persisted.current_term
                )));
            }
        }

        let mut node = Self::with_config(id, cluster_nodes, config);
        node.current_term = persisted.current_term;
        node.voted_for = persisted.voted_for;
        node.log = persisted.log;
        Ok(node)
    }

    // -- cluster helpers --

    /// Every member except this node
    pub fn peers(&self) -> impl Iterator<Item = u64> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&n| n != self.id)
    }

    /// Votes (or replicas) needed for a strict majority of the whole cluster
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Get log entry at index (1-indexed)
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// Term of the entry at index, 0 for index 0 or past the end
    pub fn get_term_at(&self, index: u64) -> u64 {
        self.get_entry(index).map(|e| e.term).unwrap_or(0)
    }

    // -- durability --

    /// Whether term, vote or log changed since the last `take_persistent_state`
    pub fn needs_persist(&self) -> bool {
        self.persist_pending
    }

    pub fn persistent_state(&self) -> PersistentState {
        PersistentState::new(self.current_term, self.voted_for, self.log.clone())
    }

    /// The state to write if anything durable changed, clearing the dirty flag
    pub fn take_persistent_state(&mut self) -> Option<PersistentState> {
        if !self.persist_pending {
            return None;
        }
        self.persist_pending = false;
        Some(self.persistent_state())
    }

    // -- role transitions --

    /// Step down to follower, adopting `term` if it is newer.
    ///
    /// Staying in the same term keeps the recorded vote.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.persist_pending = true;
        }
        if self.state != NodeState::Follower {
            info!(node_id = self.id, term = self.current_term, from = %self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Begin a new election: bump the term, vote for ourselves and build the request.
    ///
    /// A single-member cluster wins on the spot.
    pub fn start_election(&mut self) -> VoteRequest {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.votes_received = vec![self.id];
        self.leader_id = None;
        self.next_index.clear();
        self.match_index.clear();
        self.persist_pending = true;

        info!(node_id = self.id, term = self.current_term, "starting election");

        let request = VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };

        if self.has_quorum() {
            self.become_leader();
        }
        request
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        let peers: Vec<u64> = self.peers().collect();
        self.next_index.clear();
        self.match_index.clear();
        for peer in peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }

        info!(
            node_id = self.id,
            term = self.current_term,
            last_log_index = self.last_log_index(),
            "became leader"
        );
    }

    // -- RequestVote --

    /// Handle an incoming vote request.
    ///
    /// Returns the reply and whether the election timer should be reset.
    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> (VoteResponse, bool) {
        if req.term < self.current_term {
            debug!(
                node_id = self.id,
                candidate = req.candidate_id,
                term = req.term,
                current_term = self.current_term,
                "rejecting vote request from stale term"
            );
            return (self.vote_reply(false), false);
        }

        if req.term > self.current_term {
            self.become_follower(req.term);
        }

        let free_to_vote = match self.voted_for {
            None => true,
            Some(candidate) => candidate == req.candidate_id,
        };
        let log_ok = is_at_least_as_up_to_date(
            req.last_log_term,
            req.last_log_index,
            self.last_log_term(),
            self.last_log_index(),
        );
        let granted = free_to_vote && log_ok;

        if granted && self.voted_for != Some(req.candidate_id) {
            self.voted_for = Some(req.candidate_id);
            self.persist_pending = true;
        }

        debug!(
            node_id = self.id,
            candidate = req.candidate_id,
            term = req.term,
            granted,
            log_ok,
            "RequestVote response"
        );

        (self.vote_reply(granted), granted)
    }

    fn vote_reply(&self, vote_granted: bool) -> VoteResponse {
        VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a vote reply from `from`. Returns true when this reply won the election.
    pub fn handle_vote_response(&mut self, from: u64, resp: &VoteResponse) -> bool {
        if resp.term > self.current_term {
            self.become_follower(resp.term);
            return false;
        }
        if self.state != NodeState::Candidate || resp.term != self.current_term {
            return false;
        }
        if !resp.vote_granted || !self.cluster_nodes.contains(&from) {
            return false;
        }

        if !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        debug!(
            node_id = self.id,
            peer_id = from,
            term = self.current_term,
            votes = self.votes_received.len(),
            "received vote"
        );

        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    // -- client submission --

    /// Append a command to the leader's log and return the provisional entry
    pub fn append_entry(&mut self, command: Vec<u8>) -> Result<LogEntry> {
        if self.state != NodeState::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id,
            });
        }

        let entry = LogEntry::new(self.current_term, self.last_log_index() + 1, command);
        self.log.push(entry.clone());
        self.persist_pending = true;
        debug!(node_id = self.id, index = entry.index, term = entry.term, "appended command");

        // a lone leader is its own majority
        self.advance_commit_index();
        Ok(entry)
    }

    // -- AppendEntries --

    /// Build the next AppendEntries for `peer`, a heartbeat when it is caught up
    pub fn create_append_entries(&self, peer: u64) -> Option<AppendEntriesRequest> {
        if self.state != NodeState::Leader {
            return None;
        }
        let next = *self.next_index.get(&peer)?;
        let prev_log_index = next.saturating_sub(1);
        let start = prev_log_index as usize;
        let end = self
            .log
            .len()
            .min(start.saturating_add(self.config.max_entries_per_append));
        let entries = if start < end {
            self.log[start..end].to_vec()
        } else {
            Vec::new()
        };

        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries,
            leader_commit: self.commit_index,
        })
    }

    /// Handle an incoming AppendEntries.
    ///
    /// Returns the reply and whether the election timer should be reset.
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
    ) -> (AppendEntriesResponse, bool) {
        if req.term < self.current_term {
            return (self.append_reply(false, self.last_log_index()), false);
        }

        // the sender is the legitimate leader of req.term
        if req.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(req.term);
        }
        self.leader_id = Some(req.leader_id);

        if req.prev_log_index > self.last_log_index() {
            debug!(
                node_id = self.id,
                prev_log_index = req.prev_log_index,
                last_log_index = self.last_log_index(),
                "log too short for AppendEntries"
            );
            return (self.append_reply(false, self.last_log_index()), true);
        }
        if self.get_term_at(req.prev_log_index) != req.prev_log_term {
            let conflict_start = first_index_of_term_run(&self.log, req.prev_log_index);
            debug!(
                node_id = self.id,
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                local_term = self.get_term_at(req.prev_log_index),
                "log diverges at prev_log_index"
            );
            return (self.append_reply(false, conflict_start.saturating_sub(1)), true);
        }

        self.merge_entries(req);

        let last_new_index = req.last_index();
        if req.leader_commit > self.commit_index {
            let commit = req.leader_commit.min(last_new_index);
            if commit > self.commit_index {
                self.commit_index = commit;
                debug!(node_id = self.id, commit_index = commit, "follower commit advanced");
            }
        }

        (self.append_reply(true, last_new_index), true)
    }

    /// Skip entries we already hold, cut the log at the first conflict, append the rest
    fn merge_entries(&mut self, req: &AppendEntriesRequest) {
        for (offset, entry) in req.entries.iter().enumerate() {
            let index = req.prev_log_index + 1 + offset as u64;
            if index <= self.last_log_index() {
                if self.get_term_at(index) == entry.term {
                    continue;
                }
                debug!(
                    node_id = self.id,
                    index,
                    removed = self.last_log_index() - index + 1,
                    "truncating conflicting suffix"
                );
                self.log.truncate((index - 1) as usize);
            }

            for (k, e) in req.entries[offset..].iter().enumerate() {
                self.log
                    .push(LogEntry::new(e.term, index + k as u64, e.command.clone()));
            }
            self.persist_pending = true;
            debug!(
                node_id = self.id,
                appended = req.entries.len() - offset,
                last_log_index = self.last_log_index(),
                "appended entries"
            );
            return;
        }
    }

    fn append_reply(&self, success: bool, match_index: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
        }
    }

    /// Fold a follower's AppendEntries reply into its progress cursors.
    ///
    /// Returns true when the commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        from: u64,
        resp: &AppendEntriesResponse,
    ) -> bool {
        if resp.term > self.current_term {
            self.become_follower(resp.term);
            return false;
        }
        if self.state != NodeState::Leader || resp.term != self.current_term {
            return false;
        }
        let (Some(&next), Some(&matched)) = (self.next_index.get(&from), self.match_index.get(&from))
        else {
            return false;
        };

        if resp.success {
            let replicated = resp.match_index.min(self.last_log_index()).max(matched);
            self.match_index.insert(from, replicated);
            self.next_index.insert(from, next.max(replicated + 1));
            return self.advance_commit_index();
        }

        // jump straight to the follower's hint, never behind what it already holds
        let retry_from = next
            .saturating_sub(1)
            .min(resp.match_index + 1)
            .max(matched + 1)
            .max(1);
        debug!(
            node_id = self.id,
            peer_id = from,
            next_index = retry_from,
            "AppendEntries rejected, backing off"
        );
        self.next_index.insert(from, retry_from);
        false
    }

    /// Move commit_index to the highest current-term index held by a majority.
    ///
    /// Entries from earlier terms are only committed underneath such an index.
    pub fn advance_commit_index(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }
        let quorum = self.quorum_size();

        let mut n = self.last_log_index();
        while n > self.commit_index {
            if self.get_term_at(n) != self.current_term {
                // terms never increase going backwards, nothing lower qualifies
                break;
            }
            let replicas = 1 + self.match_index.values().filter(|&&m| m >= n).count();
            if replicas >= quorum {
                debug!(node_id = self.id, commit_index = n, "leader commit advanced");
                self.commit_index = n;
                return true;
            }
            n -= 1;
        }
        false
    }

    // -- apply --

    /// Committed entries not yet handed to the application, advancing last_applied
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        while self.last_applied < self.commit_index {
            let Some(entry) = self.get_entry(self.last_applied + 1) else {
                break;
            };
            entries.push(entry.clone());
            self.last_applied += 1;
        }
        entries
    }
}

/// Check that a cluster description is usable by member `id`
pub fn validate_cluster(id: u64, cluster_nodes: &[u64]) -> Result<()> {
    if cluster_nodes.is_empty() {
        return Err(RaftError::InvalidCluster("cluster has no members".into()));
    }
    if !cluster_nodes.contains(&id) {
        return Err(RaftError::InvalidCluster(format!(
            "node {id} is not a member of {cluster_nodes:?}"
        )));
    }
    let mut sorted = cluster_nodes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != cluster_nodes.len() {
        return Err(RaftError::InvalidCluster(format!(
            "duplicate members in {cluster_nodes:?}"
        )));
    }
    Ok(())
}
