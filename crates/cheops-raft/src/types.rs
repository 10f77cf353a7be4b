//! Core type definitions for openraft integration.

use std::collections::BTreeSet;
use std::io::Cursor;

use cheops_core::{Operation, ReplyDocument};
use openraft::BasicNode;
use serde::{Deserialize, Serialize};

/// Node identifier type.
pub type NodeId = u64;

/// Replication group identifier.
pub type GroupId = u64;

/// The bootstrap group every node belongs to. Its log carries the catalog of
/// all other groups.
pub const BOOTSTRAP_GROUP: GroupId = 0;

/// Type alias for the openraft Raft instance with our configuration.
pub type CheopsRaft = openraft::Raft<TypeConfig>;

/// Type alias for log entry.
pub type LogEntry = openraft::Entry<TypeConfig>;

/// Type alias for log ID.
pub type LogId = openraft::LogId<NodeId>;

/// Type alias for vote.
pub type Vote = openraft::Vote<NodeId>;

/// Type alias for membership - uses NodeId and BasicNode directly.
pub type Membership = openraft::Membership<NodeId, BasicNode>;

/// Type alias for stored membership.
pub type StoredMembership = openraft::StoredMembership<NodeId, BasicNode>;

/// Type alias for snapshot metadata.
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, BasicNode>;

openraft::declare_raft_types!(
    /// Cheops Raft type configuration.
    pub TypeConfig:
        D = GroupEntry,
        R = GroupResponse,
        NodeId = NodeId,
        Node = BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
);

/// A member of a replication group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Peer {
    /// Raft node id of the member.
    #[serde(rename = "ID")]
    pub id: NodeId,
    /// `host:port` the member's transport listens on.
    pub address: String,
    /// Site name the member serves. Defaults to the host part of `address`.
    #[serde(default)]
    pub site: String,
}

impl Peer {
    /// Create a peer whose site is the host part of `address`.
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        let address = address.into();
        let site = host_of(&address).to_string();
        Self { id, address, site }
    }

    /// Set an explicit site name.
    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = site.into();
        self
    }

    /// Site name, falling back to the address host when none was recorded.
    pub fn site(&self) -> &str {
        if self.site.is_empty() {
            host_of(&self.address)
        } else {
            &self.site
        }
    }

    /// Node descriptor used in openraft membership.
    pub fn node(&self) -> BasicNode {
        BasicNode {
            addr: self.address.clone(),
        }
    }
}

/// Host part of a `host:port` address.
fn host_of(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => address,
    }
}

/// Declaration of a replication group, as recorded in the bootstrap group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateGroup {
    /// Id of the new group.
    pub group_id: GroupId,
    /// Its members.
    pub peers: Vec<Peer>,
}

impl CreateGroup {
    /// Create a group declaration.
    pub fn new(group_id: GroupId, peers: Vec<Peer>) -> Self {
        Self { group_id, peers }
    }

    /// Sites served by the members.
    pub fn sites(&self) -> BTreeSet<String> {
        self.peers.iter().map(|p| p.site().to_string()).collect()
    }

    /// Whether `node_id` is a member.
    pub fn includes(&self, node_id: NodeId) -> bool {
        self.peers.iter().any(|p| p.id == node_id)
    }
}

/// Entry written to a group's log.
///
/// This is the only payload the state machine understands; it is decoded
/// once when the entry is read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupEntry {
    /// An operation every member should consider for execution.
    OperationSubmitted(Operation),
    /// A member finished running an operation.
    ReplyRecorded(ReplyDocument),
    /// A new group was declared (bootstrap group only).
    GroupCreated(CreateGroup),
}

impl GroupEntry {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            GroupEntry::OperationSubmitted(_) => "operation",
            GroupEntry::ReplyRecorded(_) => "reply",
            GroupEntry::GroupCreated(_) => "group",
        }
    }
}

/// Outcome of applying a [`GroupEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupResponse {
    /// The entry was recorded.
    Recorded,
    /// An equivalent entry had already been recorded; nothing changed.
    Duplicate,
    /// A group with the same site set already exists.
    GroupExists(GroupId),
    /// The entry was refused.
    Rejected(String),
    /// Blank and membership entries.
    Noop,
}

/// One operation of a group log together with the replies it collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogDump {
    /// The operation.
    pub request: Operation,
    /// Replies recorded so far, one per site.
    pub replies: Vec<ReplyDocument>,
}

/// Snapshot of one group as seen from this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupDump {
    /// The group.
    #[serde(rename = "Id")]
    pub group_id: GroupId,
    /// Member addresses.
    pub members: Vec<String>,
    /// Role of this node in the group.
    pub state: String,
    /// Operations in commit order.
    pub log: Vec<LogDump>,
}
