//! Leader forwarding for group writes.

use std::time::Duration;

use crate::error::ReplicationError;
use crate::network::messages::{RaftEnvelope, RaftMessage, WriteRejection};
use crate::network::transport::send_envelope;
use crate::types::{GroupEntry, GroupId, GroupResponse, NodeId};

/// Forwards writes of one group to its current leader.
///
/// When a member that is not the leader is asked to submit an entry, the
/// entry is sent to the leader's transport, which proposes it and answers
/// once it is applied there.
pub struct LeaderRouter {
    group_id: GroupId,
    timeout: Duration,
}

impl LeaderRouter {
    /// Create a router for `group_id`.
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            timeout: Duration::from_secs(10),
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Forward `entry` to the leader at `leader_addr`.
    ///
    /// Returns the committed log index and the leader's apply response.
    pub async fn forward(
        &self,
        leader_id: NodeId,
        leader_addr: &str,
        entry: GroupEntry,
    ) -> Result<(u64, GroupResponse), ReplicationError> {
        tracing::debug!(
            group_id = self.group_id,
            leader_id,
            leader_addr,
            kind = entry.kind(),
            "forwarding write to leader"
        );

        let envelope = RaftEnvelope::new(self.group_id, RaftMessage::ClientWriteRequest(entry));
        match send_envelope(leader_addr, envelope, self.timeout).await? {
            RaftMessage::ClientWriteResponse(Ok(written)) => Ok((written.log_index, written.response)),
            RaftMessage::ClientWriteResponse(Err(WriteRejection::ForwardToLeader {
                leader_id,
                leader_addr,
            })) => Err(ReplicationError::NotLeader {
                group_id: self.group_id,
                leader_id,
                leader_addr,
            }),
            RaftMessage::ClientWriteResponse(Err(WriteRejection::Failed(reason))) => {
                Err(ReplicationError::Submit(reason))
            }
            RaftMessage::Unavailable(reason) => Err(ReplicationError::Network(reason)),
            other => Err(ReplicationError::Network(format!(
                "unexpected response type: {}",
                other.kind()
            ))),
        }
    }
}
