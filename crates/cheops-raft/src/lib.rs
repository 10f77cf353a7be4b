//! Cheops Raft - per-site-set replication groups using openraft.
//!
//! Every distinct set of cooperating sites gets its own consensus group. A
//! group's log carries the operations submitted for its resources and the
//! replies of each site that ran them, so all members agree on one order of
//! both. A bootstrap group spanning every known site records which groups
//! exist.
//!
//! # Architecture
//!
//! The crate implements openraft's traits per group:
//! - [`SledRaftLogStorage`] - Persistent log storage using sled
//! - [`GroupStateMachine`] - State machine recording entries in a [`GroupLedger`]
//! - [`NngRaftNetwork`] - Network transport using NNG, one listener per node
//!
//! On top of these, [`Node`] resolves site sets to groups, runs committed
//! operations through an [`Executor`](cheops_core::Executor) and streams the
//! replies back to the submitter.
//!
//! # Usage
//!
//! ```ignore
//! use cheops_raft::{Node, NodeConfig, Peer};
//!
//! let config = NodeConfig::new(1)
//!     .with_raft_listen_addr("0.0.0.0:7100")
//!     .with_state_dir("/var/lib/cheops")
//!     .with_bootstrap_peers(vec![
//!         Peer::new(1, "site-a:7100"),
//!         Peer::new(2, "site-b:7100"),
//!         Peer::new(3, "site-c:7100"),
//!     ]);
//!
//! let node = Node::start(config, executor).await?;
//!
//! // Run a command on three sites and wait for their replies
//! let replies = node
//!     .execute(&["site-a", "site-b", "site-c"], "vm-42", OperationClass::Idempotent, command)
//!     .await?;
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod storage;
pub mod types;

// Re-export main types
pub use cluster::{GroupRegistry, GroupRole, Node, ReplicationGroup, ReplyBus, ReplyStream};
pub use config::{NodeConfig, RaftConfig};
pub use error::ReplicationError;
pub use network::{GroupTable, NngRaftNetwork, RaftTransport};
pub use storage::{GroupLedger, GroupStateMachine, SledRaftLogStorage};
pub use types::{
    CreateGroup, GroupDump, GroupEntry, GroupId, GroupResponse, LogDump, NodeId, Peer, TypeConfig,
    BOOTSTRAP_GROUP,
};

// Re-export openraft types that users might need
pub use openraft::{BasicNode, Raft, RaftMetrics};
