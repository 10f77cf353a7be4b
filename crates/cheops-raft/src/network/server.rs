//! Raft RPC server for handling incoming requests of every local group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_nng::AsyncContext;
use nng::{Message, Protocol, Socket};
use openraft::error::{ClientWriteError, RaftError};
use parking_lot::RwLock;

use crate::error::ReplicationError;
use crate::network::messages::{ForwardedWrite, RaftEnvelope, RaftMessage, WriteRejection};
use crate::types::{CheopsRaft, GroupEntry, GroupId, NodeId};

/// Raft instances of the groups open on this node, by group id.
#[derive(Default)]
pub struct GroupTable {
    groups: RwLock<HashMap<GroupId, CheopsRaft>>,
}

impl GroupTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the Raft instance of a group.
    pub fn insert(&self, group_id: GroupId, raft: CheopsRaft) {
        self.groups.write().insert(group_id, raft);
    }

    /// Look up a group.
    pub fn get(&self, group_id: GroupId) -> Option<CheopsRaft> {
        self.groups.read().get(&group_id).cloned()
    }

    /// Forget a group.
    pub fn remove(&self, group_id: GroupId) -> Option<CheopsRaft> {
        self.groups.write().remove(&group_id)
    }

    /// Ids of all registered groups, ascending.
    pub fn ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<_> = self.groups.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Raft RPC server that handles incoming group messages.
///
/// One REP socket serves all groups of the node. Worker threads each own an
/// [`AsyncContext`] and a single-threaded runtime, so a slow forwarded write
/// never blocks heartbeats of other groups.
pub struct RaftTransport {
    node_id: NodeId,
    listen_addr: String,
    socket: Socket,
    stop_flag: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl RaftTransport {
    /// Listen on `listen_addr` and start `workers` worker threads.
    pub fn start(
        node_id: NodeId,
        listen_addr: impl Into<String>,
        groups: Arc<GroupTable>,
        workers: usize,
    ) -> Result<Self, ReplicationError> {
        let listen_addr = listen_addr.into();
        let socket = Socket::new(Protocol::Rep0)
            .map_err(|e| ReplicationError::Network(format!("Failed to create socket: {}", e)))?;

        let addr = format!("tcp://{}", listen_addr);
        socket.listen(&addr).map_err(|e| {
            ReplicationError::Initialization(format!("Failed to listen on {}: {}", addr, e))
        })?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(workers.max(1));
        for worker_id in 0..workers.max(1) {
            let socket = socket.clone();
            let groups = groups.clone();
            let stop_flag = stop_flag.clone();

            let handle = thread::Builder::new()
                .name(format!("cheops-raft-{}-{}", node_id, worker_id))
                .spawn(move || run_worker(worker_id, socket, groups, stop_flag))
                .map_err(|e| {
                    ReplicationError::Initialization(format!(
                        "Failed to spawn transport worker: {}",
                        e
                    ))
                })?;
            handles.push(handle);
        }

        tracing::info!(node_id, address = %addr, workers = handles.len(), "raft transport started");

        Ok(Self {
            node_id,
            listen_addr,
            socket,
            stop_flag,
            handles,
        })
    }

    /// Address the transport listens on.
    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Stop the workers and close the socket.
    pub async fn shutdown(self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let handles = self.handles;
        let _ = tokio::task::spawn_blocking(move || {
            for handle in handles {
                let _ = handle.join();
            }
        })
        .await;
        self.socket.close();
        tracing::info!(node_id = self.node_id, "raft transport stopped");
    }
}

fn run_worker(
    worker_id: usize,
    socket: Socket,
    groups: Arc<GroupTable>,
    stop_flag: Arc<AtomicBool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, worker_id, "failed to build transport worker runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let mut ctx = match AsyncContext::try_from(&socket) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!(error = %e, worker_id, "failed to create async context");
                return;
            }
        };

        loop {
            if stop_flag.load(Ordering::SeqCst) {
                tracing::debug!(worker_id, "transport worker stopping");
                return;
            }

            let request = match ctx.receive(Some(Duration::from_secs(1))).await {
                Ok(msg) => msg,
                Err(nng::Error::TimedOut) => continue,
                Err(nng::Error::Closed) => return,
                Err(e) => {
                    tracing::error!(error = %e, worker_id, "receive error");
                    continue;
                }
            };

            let response = match serde_json::from_slice::<RaftEnvelope>(request.as_slice()) {
                Ok(envelope) => handle_envelope(&groups, envelope).await,
                Err(e) => {
                    tracing::warn!(error = %e, worker_id, "failed to parse raft message");
                    RaftMessage::Unavailable(format!("malformed message: {}", e))
                }
            };

            let bytes = match serde_json::to_vec(&response) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(error = %e, worker_id, "failed to serialize response");
                    continue;
                }
            };

            if let Err((_, e)) = ctx.send(Message::from(bytes.as_slice()), None).await {
                tracing::error!(error = %e, worker_id, "failed to send response");
            }
        }
    });
}

/// Dispatch one message to the Raft instance of its group.
pub async fn handle_envelope(groups: &GroupTable, envelope: RaftEnvelope) -> RaftMessage {
    let group_id = envelope.group_id;
    let Some(raft) = groups.get(group_id) else {
        tracing::debug!(group_id, kind = envelope.message.kind(), "message for unknown group");
        return RaftMessage::Unavailable(format!("group {} is not open on this node", group_id));
    };

    match envelope.message {
        RaftMessage::VoteRequest(req) => match raft.vote(req).await {
            Ok(resp) => RaftMessage::VoteResponse(resp),
            Err(e) => RaftMessage::Unavailable(e.to_string()),
        },
        RaftMessage::AppendEntriesRequest(req) => match raft.append_entries(req).await {
            Ok(resp) => RaftMessage::AppendEntriesResponse(resp),
            Err(e) => RaftMessage::Unavailable(e.to_string()),
        },
        RaftMessage::InstallSnapshotRequest(req) => {
            tracing::debug!(
                group_id,
                offset = req.offset,
                size = req.data.len(),
                done = req.done,
                "snapshot chunk received"
            );
            match raft.install_snapshot(req).await {
                Ok(resp) => RaftMessage::InstallSnapshotResponse(resp),
                Err(e) => RaftMessage::Unavailable(e.to_string()),
            }
        }
        RaftMessage::ClientWriteRequest(entry) => {
            RaftMessage::ClientWriteResponse(handle_client_write(&raft, entry).await)
        }
        other => {
            tracing::warn!(group_id, kind = other.kind(), "unexpected message type");
            RaftMessage::Unavailable(format!("unexpected message type: {}", other.kind()))
        }
    }
}

async fn handle_client_write(
    raft: &CheopsRaft,
    entry: GroupEntry,
) -> Result<ForwardedWrite, WriteRejection> {
    match raft.client_write(entry).await {
        Ok(resp) => Ok(ForwardedWrite {
            log_index: resp.log_id.index,
            response: resp.data,
        }),
        Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
            Err(WriteRejection::ForwardToLeader {
                leader_id: forward.leader_id,
                leader_addr: forward.leader_node.map(|node| node.addr),
            })
        }
        Err(e) => Err(WriteRejection::Failed(e.to_string())),
    }
}
