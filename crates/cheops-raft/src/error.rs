//! Error types for cheops-raft.

use thiserror::Error;

use crate::types::GroupId;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Error while setting up a node or a group. Only these are fatal at start-up.
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// Error during storage operations.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Error during network operations.
    #[error("Network error: {0}")]
    Network(String),

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A submission was rejected by the group and not retried.
    #[error("Submit error: {0}")]
    Submit(String),

    /// No leader was elected within the retry budget.
    #[error("No leader available for group {0}")]
    NoLeader(GroupId),

    /// This node is not the leader of the group.
    #[error("Not the leader of group {group_id}, current leader is node {leader_id:?} at {leader_addr:?}")]
    NotLeader {
        /// The group written to.
        group_id: GroupId,
        /// The ID of the current leader.
        leader_id: Option<u64>,
        /// The address of the current leader.
        leader_addr: Option<String>,
    },

    /// Fewer sites than a replication group needs.
    #[error("At least {required} distinct sites are required, got {got}")]
    InsufficientSites {
        /// Minimum number of sites.
        required: usize,
        /// Number of distinct sites supplied.
        got: usize,
    },

    /// A site is not known to the bootstrap group.
    #[error("Unknown site: {0}")]
    UnknownSite(String),

    /// No group with this id is instantiated on this node.
    #[error("Unknown group: {0}")]
    UnknownGroup(GroupId),

    /// This node is not a member of the group.
    #[error("Node is not a member of group {0}")]
    NotMember(GroupId),

    /// Error during snapshot operations.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Error during shutdown.
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// Timeout waiting for operation.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sled::Error> for ReplicationError {
    fn from(err: sled::Error) -> Self {
        ReplicationError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for ReplicationError {
    fn from(err: std::io::Error) -> Self {
        ReplicationError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(err: serde_json::Error) -> Self {
        ReplicationError::Serialization(err.to_string())
    }
}

/// Result alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;
