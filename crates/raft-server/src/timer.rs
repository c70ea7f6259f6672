//! # timer
//!
//! why: randomized election timeouts keep servers from timing out in lockstep
//! relations: owned by server.rs under the core lock, read by the role loop
//! what: random_election_timeout, ElectionTimer

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Single-shot, restartable election countdown.
///
/// Every reset draws a fresh random duration.
#[derive(Debug)]
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms,
            deadline: Instant::now() + random_election_timeout(min_ms, max_ms),
        }
    }

    pub fn reset(&mut self) {
        self.deadline = Instant::now() + random_election_timeout(self.min_ms, self.max_ms);
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
