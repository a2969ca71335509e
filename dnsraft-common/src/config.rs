use crate::error::{StoreError, StoreResult};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Consensus timing and compaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Interval between leader heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Election timeout range (min, max); a fresh value is drawn on every reset.
    pub election_timeout_ms: (u64, u64),
    /// Deadline for a single peer RPC.
    pub rpc_timeout_ms: u64,
    /// Deadline for a proposal to commit before the caller gets `Timeout`.
    pub propose_timeout_ms: u64,
    /// Take a snapshot once this many entries were applied since the last one.
    pub snapshot_threshold: u64,
    pub max_entries_per_append: usize,
    /// Buffered leader-change notifications per subscriber.
    pub leader_channel_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 50,
            election_timeout_ms: (300, 600),
            rpc_timeout_ms: 200,
            propose_timeout_ms: 5_000,
            snapshot_threshold: 1_024,
            max_entries_per_append: 256,
            leader_channel_capacity: 16,
        }
    }
}

impl RaftConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_ms.0),
            Duration::from_millis(self.election_timeout_ms.1),
        )
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    pub fn validate(&self) -> StoreResult<()> {
        let (min, max) = self.election_timeout_ms;
        if min == 0 || max < min {
            return Err(StoreError::Config(format!(
                "invalid election_timeout_ms range ({}, {})",
                min, max
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= min / 2 {
            return Err(StoreError::Config(format!(
                "heartbeat_interval_ms ({}) should be << election_timeout_ms ({})",
                self.heartbeat_interval_ms, min
            )));
        }
        if self.max_entries_per_append == 0 || self.leader_channel_capacity == 0 {
            return Err(StoreError::Config(
                "max_entries_per_append and leader_channel_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Identity and storage settings for one store node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Address of this node's raft bus, advertised to peers.
    pub raft_addr: String,
    /// Directory for the log, vote record and snapshots. `None` keeps
    /// everything in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.node_id.is_empty() {
            return Err(StoreError::Config("node_id is required".into()));
        }
        if self.raft_addr.is_empty() {
            return Err(StoreError::Config("raft_addr is required".into()));
        }
        self.raft.validate()
    }
}

#[derive(Debug, Default)]
pub struct NodeConfigBuilder {
    node_id: Option<NodeId>,
    raft_addr: Option<String>,
    data_dir: Option<PathBuf>,
    raft: RaftConfig,
}

impl NodeConfigBuilder {
    pub fn node_id(mut self, id: impl Into<NodeId>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    pub fn raft_addr(mut self, addr: impl Into<String>) -> Self {
        self.raft_addr = Some(addr.into());
        self
    }

    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.raft.heartbeat_interval_ms = ms;
        self
    }

    pub fn election_timeout_ms(mut self, min: u64, max: u64) -> Self {
        self.raft.election_timeout_ms = (min, max);
        self
    }

    pub fn snapshot_threshold(mut self, entries: u64) -> Self {
        self.raft.snapshot_threshold = entries;
        self
    }

    pub fn propose_timeout_ms(mut self, ms: u64) -> Self {
        self.raft.propose_timeout_ms = ms;
        self
    }

    /// The node id defaults to the raft address, which is unique per cluster.
    pub fn build(self) -> StoreResult<NodeConfig> {
        let raft_addr = self.raft_addr.unwrap_or_default();
        let config = NodeConfig {
            node_id: self.node_id.unwrap_or_else(|| raft_addr.clone()),
            raft_addr,
            data_dir: self.data_dir,
            raft: self.raft,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Loads only the consensus timing section from a JSON file.
pub fn load_raft_config(path: impl AsRef<Path>) -> StoreResult<RaftConfig> {
    let data = fs::read_to_string(path)?;
    let config: RaftConfig = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}
