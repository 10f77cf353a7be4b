//! One replication group as seen from a member node.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cheops_core::{compute_operations_to_run, Operation, ResourceDocument};
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{BasicNode, Raft, RaftMetrics, ServerState};

use crate::cluster::router::LeaderRouter;
use crate::config::NodeConfig;
use crate::error::ReplicationError;
use crate::network::factory::NngNetworkFactory;
use crate::storage::ledger::GroupLedger;
use crate::storage::log_storage::SledRaftLogStorage;
use crate::storage::state_machine::{ApplyHook, GroupStateMachine};
use crate::types::{
    CheopsRaft, CreateGroup, GroupDump, GroupEntry, GroupId, GroupResponse, NodeId, Peer,
};

/// Role of this node in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRole {
    /// Membership not yet known locally.
    Initializing,
    /// No leader is currently known.
    Electing,
    /// This node leads the group.
    Leader,
    /// Another member leads the group.
    Follower,
    /// The group was shut down.
    Stopped,
}

impl GroupRole {
    /// Derive the role from openraft metrics.
    pub fn from_metrics(metrics: &RaftMetrics<NodeId, BasicNode>) -> Self {
        let has_voters = metrics
            .membership_config
            .membership()
            .voter_ids()
            .next()
            .is_some();
        Self::from_state(metrics.state, metrics.current_leader, has_voters)
    }

    fn from_state(state: ServerState, leader: Option<NodeId>, has_voters: bool) -> Self {
        match state {
            ServerState::Shutdown => GroupRole::Stopped,
            ServerState::Leader => GroupRole::Leader,
            ServerState::Candidate => GroupRole::Electing,
            ServerState::Follower | ServerState::Learner => {
                if !has_voters {
                    GroupRole::Initializing
                } else if leader.is_none() {
                    GroupRole::Electing
                } else {
                    GroupRole::Follower
                }
            }
        }
    }
}

impl fmt::Display for GroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupRole::Initializing => "Initializing",
            GroupRole::Electing => "Electing",
            GroupRole::Leader => "Leader",
            GroupRole::Follower => "Follower",
            GroupRole::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// A running member of one replication group.
///
/// Owns the group's Raft instance and its sled database under
/// `<state_dir>/<group_id>/`.
pub struct ReplicationGroup {
    group_id: GroupId,
    node_id: NodeId,
    peers: Vec<Peer>,
    raft: CheopsRaft,
    ledger: Arc<GroupLedger>,
    router: LeaderRouter,
    submit_retries: u32,
    submit_backoff: Duration,
    apply_timeout: Duration,
}

impl ReplicationGroup {
    /// Open (or reopen) the group described by `group` on this node.
    ///
    /// Every member initializes the group with the same membership; a member
    /// whose log already holds it simply rejoins.
    pub async fn start(
        config: &NodeConfig,
        group: &CreateGroup,
        hook: ApplyHook,
    ) -> Result<Self, ReplicationError> {
        let group_id = group.group_id;
        if !group.includes(config.node_id) {
            return Err(ReplicationError::NotMember(group_id));
        }

        let dir = config.group_dir(group_id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            ReplicationError::Initialization(format!(
                "Failed to create group dir {}: {}",
                dir.display(),
                e
            ))
        })?;
        let db = Arc::new(sled::open(dir.join("db")).map_err(|e| {
            ReplicationError::Initialization(format!("Failed to open group {} storage: {}", group_id, e))
        })?);

        let log_storage = SledRaftLogStorage::open(group_id, db.clone())?;
        let state_machine =
            GroupStateMachine::new(group_id, &db, dir.join("snapshots"))?.with_apply_hook(hook);
        let ledger = state_machine.ledger();
        // Work applied before the last shutdown may not have run here yet.
        state_machine.replay();

        let raft_config = Arc::new(config.raft.to_openraft(group_id)?);
        let network =
            NngNetworkFactory::new(config.node_id, group_id).with_timeout(config.rpc_timeout());

        let raft = Raft::new(config.node_id, raft_config, network, log_storage, state_machine)
            .await
            .map_err(|e| ReplicationError::Initialization(e.to_string()))?;

        let members: BTreeMap<NodeId, BasicNode> =
            group.peers.iter().map(|p| (p.id, p.node())).collect();
        match raft.initialize(members).await {
            Ok(()) => tracing::info!(group_id, node_id = config.node_id, "group initialized"),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                tracing::info!(group_id, node_id = config.node_id, "group rejoined")
            }
            Err(e) => return Err(ReplicationError::Initialization(e.to_string())),
        }

        Ok(Self {
            group_id,
            node_id: config.node_id,
            peers: group.peers.clone(),
            raft,
            ledger,
            router: LeaderRouter::new(group_id).with_timeout(config.apply_timeout()),
            submit_retries: config.submit_retries.max(1),
            submit_backoff: config.submit_backoff(),
            apply_timeout: config.apply_timeout(),
        })
    }

    /// Group id.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// The Raft instance.
    pub fn raft(&self) -> &CheopsRaft {
        &self.raft
    }

    /// Applied state of the group on this node.
    pub fn ledger(&self) -> &Arc<GroupLedger> {
        &self.ledger
    }

    /// Group members.
    pub fn members(&self) -> &[Peer] {
        &self.peers
    }

    /// Sites served by the members, in membership order.
    pub fn member_sites(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.site().to_string()).collect()
    }

    /// Current role of this node.
    pub fn role(&self) -> GroupRole {
        GroupRole::from_metrics(&self.raft.metrics().borrow())
    }

    /// Whether this node currently leads the group.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    /// Commit `entry` in the group and wait until it is applied locally.
    ///
    /// Returns the committed log index and the state machine's response.
    ///
    /// A missing leader, a moving leader (`NotLeader`) and a failed forward to
    /// the leader (`Network`) are all retried, up to `submit_retries` attempts
    /// spaced by `submit_backoff`; running out of attempts yields `NoLeader`.
    /// Retrying after a failed forward may commit the entry twice, which the
    /// ledger records once. Any other error is returned at once.
    pub async fn submit(&self, entry: GroupEntry) -> Result<(u64, GroupResponse), ReplicationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write_once(entry.clone()).await {
                Ok((index, response)) => {
                    self.linearize(index).await?;
                    return Ok((index, response));
                }
                Err(e) if is_retryable(&e) && attempt < self.submit_retries => {
                    tracing::debug!(
                        group_id = self.group_id,
                        attempt,
                        error = %e,
                        "submit failed, retrying"
                    );
                    tokio::time::sleep(self.submit_backoff).await;
                }
                Err(ReplicationError::NotLeader { .. }) | Err(ReplicationError::Network(_)) => {
                    return Err(ReplicationError::NoLeader(self.group_id));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_once(&self, entry: GroupEntry) -> Result<(u64, GroupResponse), ReplicationError> {
        match self.raft.client_write(entry.clone()).await {
            Ok(resp) => Ok((resp.log_id.index, resp.data)),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
                match (forward.leader_id, forward.leader_node) {
                    (Some(leader_id), Some(node)) => {
                        self.router.forward(leader_id, &node.addr, entry).await
                    }
                    _ => Err(ReplicationError::NoLeader(self.group_id)),
                }
            }
            Err(e) => Err(ReplicationError::Submit(e.to_string())),
        }
    }

    /// Make sure the local state machine reflects everything up to `index`.
    async fn linearize(&self, index: u64) -> Result<(), ReplicationError> {
        if self.is_leader() {
            if let Err(e) = self.raft.ensure_linearizable().await {
                tracing::debug!(group_id = self.group_id, error = %e, "leadership check failed");
            }
        }
        self.raft
            .wait(Some(self.apply_timeout))
            .applied_index_at_least(Some(index), "submitted entry applied")
            .await
            .map_err(|e| ReplicationError::Timeout(e.to_string()))?;
        Ok(())
    }

    /// Operations this node still has to run for `resource_id`.
    ///
    /// The group log is treated as one document owned by no site, located at
    /// every member.
    pub fn operations_to_run(&self, site: &str, resource_id: &str) -> Vec<Operation> {
        let document = ResourceDocument::new("", self.member_sites())
            .with_operations(self.ledger.history(resource_id));
        let replies = self.ledger.replies_for_resource(resource_id);
        compute_operations_to_run(site, &[document], &replies)
    }

    /// Snapshot of the group for management output.
    pub fn dump(&self) -> GroupDump {
        GroupDump {
            group_id: self.group_id,
            members: self.peers.iter().map(|p| p.address.clone()).collect(),
            state: self.role().to_string(),
            log: self.ledger.dump(),
        }
    }

    /// Shut the Raft instance down.
    pub async fn shutdown(&self) -> Result<(), ReplicationError> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| ReplicationError::Shutdown(e.to_string()))?;
        self.ledger.flush()?;
        tracing::info!(group_id = self.group_id, node_id = self.node_id, "group shut down");
        Ok(())
    }
}

fn is_retryable(error: &ReplicationError) -> bool {
    matches!(
        error,
        ReplicationError::NoLeader(_)
            | ReplicationError::NotLeader { .. }
            | ReplicationError::Network(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_mapping() {
        use GroupRole::*;
        assert_eq!(GroupRole::from_state(ServerState::Learner, None, false), Initializing);
        assert_eq!(GroupRole::from_state(ServerState::Follower, None, true), Electing);
        assert_eq!(GroupRole::from_state(ServerState::Candidate, None, true), Electing);
        assert_eq!(GroupRole::from_state(ServerState::Follower, Some(2), true), Follower);
        assert_eq!(GroupRole::from_state(ServerState::Leader, Some(1), true), Leader);
        assert_eq!(GroupRole::from_state(ServerState::Shutdown, None, true), Stopped);
        assert_eq!(Electing.to_string(), "Electing");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable(&ReplicationError::NoLeader(1)));
        assert!(is_retryable(&ReplicationError::Network("refused".to_string())));
        assert!(!is_retryable(&ReplicationError::Submit("fatal".to_string())));
    }

    #[tokio::test]
    async fn test_submit_without_leader_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::new(1)
            .with_state_dir(dir.path())
            .with_submit_retries(3, 20);
        let create = CreateGroup::new(
            1,
            vec![
                Peer::new(1, "127.0.0.1:1"),
                Peer::new(2, "127.0.0.1:2"),
                Peer::new(3, "127.0.0.1:3"),
            ],
        );
        let hook: ApplyHook = Arc::new(|_, _| {});
        let group = ReplicationGroup::start(&config, &create, hook).await.unwrap();

        let operation = cheops_core::Operation::new(
            "r1",
            cheops_core::OperationClass::Commutative,
            "a",
            "vm",
            cheops_core::Command::shell("true"),
        );
        let started = std::time::Instant::now();
        let result = group.submit(GroupEntry::OperationSubmitted(operation)).await;

        assert!(matches!(result, Err(ReplicationError::NoLeader(1))));
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_ne!(group.role(), GroupRole::Leader);
        assert!(group.ledger().is_empty());
        group.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_membership() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::new(9).with_state_dir(dir.path());
        let group = CreateGroup::new(1, vec![Peer::new(1, "127.0.0.1:1")]);
        let hook: ApplyHook = Arc::new(|_, _| {});

        let result = ReplicationGroup::start(&config, &group, hook).await;
        assert!(matches!(result, Err(ReplicationError::NotMember(1))));
    }
}
