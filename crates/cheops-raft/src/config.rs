//! Configuration types for replication nodes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ReplicationError;
use crate::types::{GroupId, NodeId, Peer};

/// Consensus tuning shared by every group of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Minimum election timeout in milliseconds.
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds.
    pub election_timeout_max_ms: u64,

    /// Number of log entries between snapshots.
    pub snapshot_threshold: u64,

    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 150,
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 500,
            snapshot_threshold: 10000,
            max_entries_per_append: 100,
        }
    }
}

impl RaftConfig {
    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Set the election timeout range.
    pub fn with_election_timeout_ms(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    /// Set the snapshot threshold.
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    /// Build the openraft configuration for one group.
    pub fn to_openraft(&self, group_id: GroupId) -> Result<openraft::Config, ReplicationError> {
        openraft::Config {
            cluster_name: format!("cheops-group-{}", group_id),
            heartbeat_interval: self.heartbeat_interval_ms,
            election_timeout_min: self.election_timeout_min_ms,
            election_timeout_max: self.election_timeout_max_ms,
            max_payload_entries: self.max_entries_per_append,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            ..Default::default()
        }
        .validate()
        .map_err(|e| ReplicationError::Initialization(e.to_string()))
    }
}

/// Configuration for one replication node (one site process).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's unique ID.
    pub node_id: NodeId,

    /// Address this node listens on for group RPCs.
    pub raft_listen_addr: String,

    /// Directory holding one subdirectory per group.
    pub state_dir: PathBuf,

    /// Members of the bootstrap group, this node included.
    pub bootstrap_peers: Vec<Peer>,

    /// Consensus tuning.
    pub raft: RaftConfig,

    /// How long a caller waits for replies before missing sites time out.
    pub reply_timeout_ms: u64,

    /// Deadline for one local command execution.
    pub exec_deadline_ms: u64,

    /// Attempts made while a group has no leader.
    pub submit_retries: u32,

    /// Pause between attempts.
    pub submit_backoff_ms: u64,

    /// Timeout of one RPC to a peer.
    pub rpc_timeout_ms: u64,

    /// How long a submitter waits for its own state machine to catch up.
    pub apply_timeout_ms: u64,

    /// Worker contexts serving the group transport.
    pub transport_workers: usize,

    /// Age after which unclaimed reply-bus entries are dropped.
    pub bus_ttl_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            raft_listen_addr: "0.0.0.0:7100".to_string(),
            state_dir: PathBuf::from("./cheops-state"),
            bootstrap_peers: Vec::new(),
            raft: RaftConfig::default(),
            reply_timeout_ms: 20_000,
            exec_deadline_ms: 3_000,
            submit_retries: 10,
            submit_backoff_ms: 1_000,
            rpc_timeout_ms: 5_000,
            apply_timeout_ms: 10_000,
            transport_workers: 4,
            bus_ttl_secs: 300,
        }
    }
}

impl NodeConfig {
    /// Create a new configuration with the given node ID.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set the listen address.
    pub fn with_raft_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.raft_listen_addr = addr.into();
        self
    }

    /// Set the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Set the bootstrap group members.
    pub fn with_bootstrap_peers(mut self, peers: Vec<Peer>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    /// Set the consensus tuning.
    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    /// Set the reply timeout.
    pub fn with_reply_timeout_ms(mut self, ms: u64) -> Self {
        self.reply_timeout_ms = ms;
        self
    }

    /// Set the execution deadline.
    pub fn with_exec_deadline_ms(mut self, ms: u64) -> Self {
        self.exec_deadline_ms = ms;
        self
    }

    /// Set the retry policy used while no leader is elected.
    pub fn with_submit_retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.submit_retries = retries;
        self.submit_backoff_ms = backoff_ms;
        self
    }

    /// This node's entry in the bootstrap peers.
    pub fn local_peer(&self) -> Option<&Peer> {
        self.bootstrap_peers.iter().find(|p| p.id == self.node_id)
    }

    /// Site served by this node.
    pub fn site(&self) -> &str {
        self.local_peer().map(|p| p.site()).unwrap_or_default()
    }

    /// Storage directory of one group.
    pub fn group_dir(&self, group_id: GroupId) -> PathBuf {
        self.state_dir.join(group_id.to_string())
    }

    /// Check that the configuration describes a usable node.
    pub fn validate(&self) -> Result<(), ReplicationError> {
        if self.local_peer().is_none() {
            return Err(ReplicationError::Initialization(format!(
                "node {} is not listed among the bootstrap peers",
                self.node_id
            )));
        }
        for (i, peer) in self.bootstrap_peers.iter().enumerate() {
            let clash = self.bootstrap_peers[..i]
                .iter()
                .any(|p| p.id == peer.id || p.site() == peer.site());
            if clash {
                return Err(ReplicationError::Initialization(format!(
                    "bootstrap peer {} ({}) is listed twice",
                    peer.id,
                    peer.site()
                )));
            }
        }
        if self.raft.election_timeout_min_ms >= self.raft.election_timeout_max_ms {
            return Err(ReplicationError::Initialization(
                "election timeout range is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Reply timeout as a duration.
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Execution deadline as a duration.
    pub fn exec_deadline(&self) -> Duration {
        Duration::from_millis(self.exec_deadline_ms)
    }

    /// Backoff between submit attempts.
    pub fn submit_backoff(&self) -> Duration {
        Duration::from_millis(self.submit_backoff_ms)
    }

    /// RPC timeout as a duration.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Apply wait timeout as a duration.
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    /// Reply-bus TTL as a duration.
    pub fn bus_ttl(&self) -> Duration {
        Duration::from_secs(self.bus_ttl_secs)
    }
}
