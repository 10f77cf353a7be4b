//! Factory for creating Raft network connections.

use std::time::Duration;

use openraft::network::RaftNetworkFactory;
use openraft::BasicNode;

use crate::network::transport::NngRaftNetwork;
use crate::types::{GroupId, NodeId, TypeConfig};

/// Factory for creating NNG network connections of one group.
///
/// Each group owns its own factory, so every connection it creates stamps the
/// right group id on outgoing messages.
pub struct NngNetworkFactory {
    /// This node's ID.
    node_id: NodeId,
    /// Group the connections serve.
    group_id: GroupId,
    /// Timeout of one RPC.
    timeout: Duration,
}

impl NngNetworkFactory {
    /// Create a new network factory.
    pub fn new(node_id: NodeId, group_id: GroupId) -> Self {
        Self {
            node_id,
            group_id,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the RPC timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl RaftNetworkFactory<TypeConfig> for NngNetworkFactory {
    type Network = NngRaftNetwork;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        tracing::debug!(
            group_id = self.group_id,
            from = self.node_id,
            to = target,
            addr = %node.addr,
            "creating network client"
        );
        NngRaftNetwork::new(self.group_id, target, node.clone()).with_timeout(self.timeout)
    }
}
