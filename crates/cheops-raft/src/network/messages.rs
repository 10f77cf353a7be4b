//! Wire messages exchanged between group members.
//!
//! Every message travels inside a [`RaftEnvelope`] naming the group it belongs
//! to, so one listener serves all groups of a node. openraft's own request and
//! response types are carried as-is and encoded with serde_json.

use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};

use crate::types::{GroupEntry, GroupId, GroupResponse, NodeId, TypeConfig};

/// A message addressed to one group on the receiving node.
#[derive(Debug, Serialize, Deserialize)]
pub struct RaftEnvelope {
    /// Target group.
    pub group_id: GroupId,
    /// The message.
    pub message: RaftMessage,
}

impl RaftEnvelope {
    /// Wrap `message` for `group_id`.
    pub fn new(group_id: GroupId, message: RaftMessage) -> Self {
        Self { group_id, message }
    }
}

/// Raft RPC message wrapper.
#[derive(Debug, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Vote request (RequestVote RPC).
    VoteRequest(VoteRequest<NodeId>),
    /// Vote response.
    VoteResponse(VoteResponse<NodeId>),
    /// AppendEntries request.
    AppendEntriesRequest(AppendEntriesRequest<TypeConfig>),
    /// AppendEntries response.
    AppendEntriesResponse(AppendEntriesResponse<NodeId>),
    /// One chunk of a snapshot.
    InstallSnapshotRequest(InstallSnapshotRequest<TypeConfig>),
    /// InstallSnapshot response.
    InstallSnapshotResponse(InstallSnapshotResponse<NodeId>),
    /// A write forwarded by a member that is not the leader.
    ClientWriteRequest(GroupEntry),
    /// Outcome of a forwarded write.
    ClientWriteResponse(Result<ForwardedWrite, WriteRejection>),
    /// The receiver could not serve the request.
    Unavailable(String),
}

impl RaftMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest(_) => "vote_request",
            RaftMessage::VoteResponse(_) => "vote_response",
            RaftMessage::AppendEntriesRequest(_) => "append_entries_request",
            RaftMessage::AppendEntriesResponse(_) => "append_entries_response",
            RaftMessage::InstallSnapshotRequest(_) => "install_snapshot_request",
            RaftMessage::InstallSnapshotResponse(_) => "install_snapshot_response",
            RaftMessage::ClientWriteRequest(_) => "client_write_request",
            RaftMessage::ClientWriteResponse(_) => "client_write_response",
            RaftMessage::Unavailable(_) => "unavailable",
        }
    }
}

/// A write committed and applied by the leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedWrite {
    /// Log index the entry was committed at.
    pub log_index: u64,
    /// What the state machine answered.
    pub response: GroupResponse,
}

/// Why the receiver did not accept a forwarded write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteRejection {
    /// The receiver is not the leader; try this one instead.
    ForwardToLeader {
        /// Leader the receiver knows of.
        leader_id: Option<NodeId>,
        /// Its address.
        leader_addr: Option<String>,
    },
    /// The write failed on the leader.
    Failed(String),
}
