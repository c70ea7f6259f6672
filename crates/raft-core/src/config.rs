//! # config
//!
//! why: keep the protocol's timing knobs in one validated place
//! relations: owned by node.rs, read by raft-server for timers and batching
//! what: RaftConfig with defaults, json loading, validation

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// Timing and batching parameters, all durations in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout (inclusive)
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats / replication rounds
    pub heartbeat_interval: u64,
    /// Maximum entries carried by a single AppendEntries request
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_entries_per_append: 64,
        }
    }
}

impl RaftConfig {
    /// Parse a config from json, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RaftError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 {
            return Err(RaftError::InvalidConfig(
                "election_timeout_min must be positive".into(),
            ));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election_timeout_min ({}) exceeds election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 {
            return Err(RaftError::InvalidConfig(
                "heartbeat_interval must be positive".into(),
            ));
        }
        // followers must hear from a live leader before they give up on it
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat_interval ({}) must be below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::InvalidConfig(
                "max_entries_per_append must be positive".into(),
            ));
        }
        Ok(())
    }
}
