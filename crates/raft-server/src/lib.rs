//! # raft-server
//!
//! why: give the sans-io raft-core node clocks, tasks, durable storage and peers
//! relations: wraps raft-core's RaftNode, persists via raft-storage, runs on tokio
//! what: Raft handle, role loop, replication driver, apply pipeline, transports
//!
//! ```no_run
//! use std::sync::Arc;
//! use raft_core::RaftConfig;
//! use raft_server::{LocalNetwork, Raft};
//! use raft_storage::InMemoryStorage;
//!
//! # async fn demo() -> raft_server::Result<()> {
//! let net = LocalNetwork::new();
//! let (apply_tx, mut apply_rx) = tokio::sync::mpsc::unbounded_channel();
//! let raft = Raft::new(
//!     1,
//!     vec![1],
//!     RaftConfig::default(),
//!     Box::new(InMemoryStorage::new()),
//!     net.transport(1),
//!     apply_tx,
//! )?;
//! net.register(1, raft.clone());
//!
//! // once elected, submissions come back through the apply channel
//! if let Ok((index, _term)) = raft.start(b"SET x 1".to_vec()) {
//!     let msg = apply_rx.recv().await;
//!     assert_eq!(msg.map(|m| m.index), Some(index));
//! }
//! # Ok(())
//! # }
//! ```

mod apply;
pub mod error;
mod network;
mod replication;
mod server;
pub mod timer;
pub mod transport;

pub use apply::ApplyMsg;
pub use error::{Result, ServerError, TransportError};
pub use network::LocalNetwork;
pub use server::{Raft, Status};
pub use transport::Transport;
