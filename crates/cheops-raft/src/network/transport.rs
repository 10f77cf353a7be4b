//! NNG-based Raft network transport.

use std::future::Future;
use std::time::Duration;

use anyerror::AnyError;
use nng::options::{Options, RecvTimeout, SendTimeout};
use nng::{Protocol, Socket};
use openraft::error::{
    Fatal, InstallSnapshotError, NetworkError, RPCError, RaftError, ReplicationClosed,
    StreamingError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::storage::Snapshot;
use openraft::{BasicNode, Vote};

use crate::error::ReplicationError;
use crate::network::messages::{RaftEnvelope, RaftMessage};
use crate::types::{GroupId, NodeId, TypeConfig};

/// Size of one snapshot chunk.
const SNAPSHOT_CHUNK_SIZE: usize = 1024 * 1024;

/// Send `envelope` to the transport listening at `addr` and wait for the answer.
///
/// The exchange runs on a blocking thread with its own REQ socket.
pub async fn send_envelope(
    addr: &str,
    envelope: RaftEnvelope,
    timeout: Duration,
) -> Result<RaftMessage, ReplicationError> {
    let addr = format!("tcp://{}", addr);
    tokio::task::spawn_blocking(move || send_envelope_sync(&addr, &envelope, timeout))
        .await
        .map_err(|e| ReplicationError::Network(format!("Task join failed: {}", e)))?
}

fn send_envelope_sync(
    addr: &str,
    envelope: &RaftEnvelope,
    timeout: Duration,
) -> Result<RaftMessage, ReplicationError> {
    let socket = Socket::new(Protocol::Req0)
        .map_err(|e| ReplicationError::Network(format!("Failed to create socket: {}", e)))?;

    socket
        .set_opt::<SendTimeout>(Some(timeout))
        .map_err(|e| ReplicationError::Network(format!("Failed to set send timeout: {}", e)))?;
    socket
        .set_opt::<RecvTimeout>(Some(timeout))
        .map_err(|e| ReplicationError::Network(format!("Failed to set recv timeout: {}", e)))?;

    socket
        .dial(addr)
        .map_err(|e| ReplicationError::Network(format!("Failed to connect to {}: {}", addr, e)))?;

    let payload = serde_json::to_vec(envelope)?;
    socket
        .send(nng::Message::from(payload.as_slice()))
        .map_err(|(_, e)| ReplicationError::Network(format!("Send failed: {}", e)))?;

    let response = socket
        .recv()
        .map_err(|e| ReplicationError::Network(format!("Recv failed: {}", e)))?;

    Ok(serde_json::from_slice(response.as_slice())?)
}

/// Client side of the group RPCs towards one member.
///
/// This implements openraft's `RaftNetwork` trait for a single group; the
/// group id is stamped on every outgoing envelope.
pub struct NngRaftNetwork {
    /// Group this connection replicates.
    group_id: GroupId,
    /// Target node ID.
    pub target_id: NodeId,
    /// Target node information.
    target: BasicNode,
    /// Request timeout.
    timeout: Duration,
}

impl NngRaftNetwork {
    /// Create a connection to `target` for `group_id`.
    pub fn new(group_id: GroupId, target_id: NodeId, target: BasicNode) -> Self {
        Self {
            group_id,
            target_id,
            target,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send(&self, message: RaftMessage) -> Result<RaftMessage, ReplicationError> {
        let kind = message.kind();
        let envelope = RaftEnvelope::new(self.group_id, message);
        let result = send_envelope(&self.target.addr, envelope, self.timeout).await;
        if let Err(e) = &result {
            tracing::debug!(
                group_id = self.group_id,
                target = self.target_id,
                kind,
                error = %e,
                "rpc failed"
            );
        }
        result
    }
}

fn unexpected(message: &RaftMessage) -> NetworkError {
    NetworkError::new(&AnyError::error(format!(
        "unexpected response type: {}",
        message.kind()
    )))
}

fn unavailable(reason: &str) -> Unreachable {
    Unreachable::new(&AnyError::error(reason))
}

impl RaftNetwork<TypeConfig> for NngRaftNetwork {
    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        match self.send(RaftMessage::VoteRequest(rpc)).await {
            Ok(RaftMessage::VoteResponse(resp)) => Ok(resp),
            Ok(RaftMessage::Unavailable(reason)) => Err(RPCError::Unreachable(unavailable(&reason))),
            Ok(other) => Err(RPCError::Network(unexpected(&other))),
            Err(e) => Err(RPCError::Unreachable(Unreachable::new(&e))),
        }
    }

    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        match self.send(RaftMessage::AppendEntriesRequest(rpc)).await {
            Ok(RaftMessage::AppendEntriesResponse(resp)) => Ok(resp),
            Ok(RaftMessage::Unavailable(reason)) => Err(RPCError::Unreachable(unavailable(&reason))),
            Ok(other) => Err(RPCError::Network(unexpected(&other))),
            Err(e) => Err(RPCError::Unreachable(Unreachable::new(&e))),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        match self.send(RaftMessage::InstallSnapshotRequest(rpc)).await {
            Ok(RaftMessage::InstallSnapshotResponse(resp)) => Ok(resp),
            Ok(RaftMessage::Unavailable(reason)) => Err(RPCError::Unreachable(unavailable(&reason))),
            Ok(other) => Err(RPCError::Network(unexpected(&other))),
            Err(e) => Err(RPCError::Unreachable(Unreachable::new(&e))),
        }
    }

    async fn full_snapshot(
        &mut self,
        vote: Vote<NodeId>,
        snapshot: Snapshot<TypeConfig>,
        _cancel: impl Future<Output = ReplicationClosed> + Send + 'static,
        _option: RPCOption,
    ) -> Result<SnapshotResponse<NodeId>, StreamingError<TypeConfig, Fatal<NodeId>>> {
        let meta = snapshot.meta;
        let data = snapshot.snapshot.into_inner();

        // An empty snapshot still needs one terminating chunk.
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&data[..]]
        } else {
            data.chunks(SNAPSHOT_CHUNK_SIZE).collect()
        };
        let last = chunks.len() - 1;

        let mut offset = 0u64;
        let mut response_vote = vote;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let request = InstallSnapshotRequest {
                vote,
                meta: meta.clone(),
                offset,
                data: chunk.to_vec(),
                done: i == last,
            };
            offset += chunk.len() as u64;

            match self.send(RaftMessage::InstallSnapshotRequest(request)).await {
                Ok(RaftMessage::InstallSnapshotResponse(resp)) => {
                    response_vote = resp.vote;
                    if resp.vote > vote {
                        break;
                    }
                }
                Ok(RaftMessage::Unavailable(reason)) => {
                    return Err(StreamingError::Unreachable(unavailable(&reason)));
                }
                Ok(other) => return Err(StreamingError::Network(unexpected(&other))),
                Err(e) => {
                    tracing::warn!(
                        group_id = self.group_id,
                        target = self.target_id,
                        error = %e,
                        "snapshot transfer failed"
                    );
                    return Err(StreamingError::Unreachable(Unreachable::new(&e)));
                }
            }
        }

        tracing::info!(
            group_id = self.group_id,
            target = self.target_id,
            snapshot_id = %meta.snapshot_id,
            bytes = offset,
            "snapshot sent"
        );
        Ok(SnapshotResponse { vote: response_vote })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_configuration() {
        let network = NngRaftNetwork::new(
            2,
            1,
            BasicNode {
                addr: "localhost:9001".to_string(),
            },
        )
        .with_timeout(Duration::from_secs(10));

        assert_eq!(network.timeout, Duration::from_secs(10));
        assert_eq!(network.group_id, 2);
    }

    #[tokio::test]
    async fn test_send_to_closed_port_fails() {
        let envelope = RaftEnvelope::new(0, RaftMessage::Unavailable("ping".to_string()));
        let result = send_envelope("127.0.0.1:1", envelope, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ReplicationError::Network(_))));
    }
}
