//! # transport
//!
//! why: keep the server independent of how RPCs travel between members
//! relations: implemented by network.rs (in-process), called by server.rs
//! what: Transport trait

use async_trait::async_trait;
use raft_core::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};

use crate::error::TransportError;

/// Point-to-point request/reply calls from this server to a peer.
///
/// A call either yields the peer's genuine reply or a `TransportError`.
/// An error never means the peer did not act on the request.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        target: u64,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError>;

    async fn append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;
}
