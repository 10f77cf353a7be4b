//! Mapping from site sets to replication groups.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::cluster::group::ReplicationGroup;
use crate::config::NodeConfig;
use crate::error::ReplicationError;
use crate::network::server::GroupTable;
use crate::storage::state_machine::ApplyHook;
use crate::types::{CreateGroup, GroupEntry, GroupId, GroupResponse, NodeId, Peer, BOOTSTRAP_GROUP};

/// Attempts made by [`GroupRegistry::resolve`] when a concurrent creator wins.
const RESOLVE_ATTEMPTS: usize = 3;

const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The groups known to a node and the ones it has open.
///
/// The catalog of groups lives in the bootstrap group's ledger, so every
/// member of group 0 agrees on which site set maps to which group.
pub struct GroupRegistry {
    config: Arc<NodeConfig>,
    table: Arc<GroupTable>,
    groups: RwLock<HashMap<GroupId, Arc<ReplicationGroup>>>,
    opening: tokio::sync::Mutex<()>,
    hook: ApplyHook,
}

impl GroupRegistry {
    /// Create a registry that registers opened groups in `table`.
    pub fn new(config: Arc<NodeConfig>, table: Arc<GroupTable>, hook: ApplyHook) -> Self {
        Self {
            config,
            table,
            groups: RwLock::new(HashMap::new()),
            opening: tokio::sync::Mutex::new(()),
            hook,
        }
    }

    /// This node's ID.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Declaration of the bootstrap group.
    pub fn bootstrap_group(&self) -> CreateGroup {
        CreateGroup::new(BOOTSTRAP_GROUP, self.config.bootstrap_peers.clone())
    }

    /// An open group.
    pub fn get(&self, group_id: GroupId) -> Option<Arc<ReplicationGroup>> {
        self.groups.read().get(&group_id).cloned()
    }

    /// All open groups, by ascending id.
    pub fn open_groups(&self) -> Vec<Arc<ReplicationGroup>> {
        let mut groups: Vec<_> = self.groups.read().values().cloned().collect();
        groups.sort_by_key(|g| g.group_id());
        groups
    }

    fn bootstrap(&self) -> Result<Arc<ReplicationGroup>, ReplicationError> {
        self.get(BOOTSTRAP_GROUP)
            .ok_or(ReplicationError::UnknownGroup(BOOTSTRAP_GROUP))
    }

    /// Groups recorded in the bootstrap group's catalog.
    pub fn catalog(&self) -> Vec<CreateGroup> {
        self.get(BOOTSTRAP_GROUP)
            .map(|g| g.ledger().groups())
            .unwrap_or_default()
    }

    /// The bootstrap group followed by every cataloged group.
    pub fn known_groups(&self) -> Vec<CreateGroup> {
        let mut groups = vec![self.bootstrap_group()];
        groups.extend(self.catalog());
        groups
    }

    /// The known group serving exactly `sites`.
    pub fn find(&self, sites: &BTreeSet<String>) -> Option<CreateGroup> {
        self.known_groups().into_iter().find(|g| &g.sites() == sites)
    }

    /// Bootstrap peers serving `sites`.
    pub fn peers_for(&self, sites: &BTreeSet<String>) -> Result<Vec<Peer>, ReplicationError> {
        sites
            .iter()
            .map(|site| {
                self.config
                    .bootstrap_peers
                    .iter()
                    .find(|p| p.site() == site)
                    .cloned()
                    .ok_or_else(|| ReplicationError::UnknownSite(site.clone()))
            })
            .collect()
    }

    /// The group serving exactly `sites`, creating it if none exists.
    ///
    /// Creation goes through the bootstrap group; a creator that loses a race
    /// for the same id or site set looks the group up again.
    pub async fn resolve(
        &self,
        sites: &BTreeSet<String>,
    ) -> Result<Arc<ReplicationGroup>, ReplicationError> {
        for attempt in 1..=RESOLVE_ATTEMPTS {
            if let Some(existing) = self.find(sites) {
                return self.open(&existing).await;
            }

            let peers = self.peers_for(sites)?;
            let group_id = self
                .known_groups()
                .iter()
                .map(|g| g.group_id)
                .max()
                .unwrap_or(BOOTSTRAP_GROUP)
                + 1;
            let create = CreateGroup::new(group_id, peers);

            match self.create(create.clone()).await {
                Ok(created) if created == group_id => return self.open(&create).await,
                Ok(existing) => {
                    tracing::debug!(group_id = existing, attempt, "site set already served");
                }
                Err(ReplicationError::Submit(reason)) => {
                    tracing::debug!(group_id, attempt, reason = %reason, "group creation lost a race");
                }
                Err(e) => return Err(e),
            }
        }

        match self.find(sites) {
            Some(existing) => self.open(&existing).await,
            None => Err(ReplicationError::Submit(format!(
                "could not create a group for {:?}",
                sites
            ))),
        }
    }

    /// Record `create` in the bootstrap group's catalog.
    ///
    /// Returns the id of the group serving the site set; this is an earlier
    /// group's id when the site set was already served.
    pub async fn create(&self, create: CreateGroup) -> Result<GroupId, ReplicationError> {
        let group_id = create.group_id;
        let bootstrap = self.bootstrap()?;
        let (_, response) = bootstrap.submit(GroupEntry::GroupCreated(create)).await?;
        match response {
            GroupResponse::Recorded | GroupResponse::Duplicate => {
                tracing::info!(group_id, "group created");
                Ok(group_id)
            }
            GroupResponse::GroupExists(existing) => Ok(existing),
            GroupResponse::Rejected(reason) => Err(ReplicationError::Submit(reason)),
            GroupResponse::Noop => Err(ReplicationError::Internal(
                "group creation produced no state change".to_string(),
            )),
        }
    }

    /// Open `group` locally unless it is already open.
    pub async fn open(&self, group: &CreateGroup) -> Result<Arc<ReplicationGroup>, ReplicationError> {
        if let Some(open) = self.get(group.group_id) {
            return Ok(open);
        }
        if !group.includes(self.config.node_id) {
            return Err(ReplicationError::NotMember(group.group_id));
        }

        let _guard = self.opening.lock().await;
        if let Some(open) = self.get(group.group_id) {
            return Ok(open);
        }

        let opened =
            Arc::new(ReplicationGroup::start(&self.config, group, self.hook.clone()).await?);
        self.table.insert(group.group_id, opened.raft().clone());
        self.groups.write().insert(group.group_id, opened.clone());
        tracing::info!(
            group_id = group.group_id,
            node_id = self.config.node_id,
            members = group.peers.len(),
            "group opened"
        );
        Ok(opened)
    }

    /// Wait up to `timeout` for `group_id` to be opened.
    pub async fn wait_open(
        &self,
        group_id: GroupId,
        timeout: Duration,
    ) -> Option<Arc<ReplicationGroup>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(group) = self.get(group_id) {
                return Some(group);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(OPEN_POLL_INTERVAL).await;
        }
    }

    /// Shut every open group down.
    pub async fn shutdown(&self) {
        let groups: Vec<_> = self.groups.write().drain().map(|(_, g)| g).collect();
        for group in groups {
            self.table.remove(group.group_id());
            if let Err(e) = group.shutdown().await {
                tracing::warn!(group_id = group.group_id(), error = %e, "group shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> GroupRegistry {
        let config = NodeConfig::new(1).with_bootstrap_peers(vec![
            Peer::new(1, "10.0.0.1:7100"),
            Peer::new(2, "10.0.0.2:7100"),
            Peer::new(3, "10.0.0.3:7100"),
            Peer::new(4, "10.0.0.4:7100").with_site("edge"),
        ]);
        GroupRegistry::new(Arc::new(config), Arc::new(GroupTable::new()), Arc::new(|_, _| {}))
    }

    fn sites(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_find_bootstrap_group() {
        let registry = registry();
        let found = registry
            .find(&sites(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "edge"]))
            .unwrap();
        assert_eq!(found.group_id, BOOTSTRAP_GROUP);
        assert!(registry.find(&sites(&["10.0.0.1", "10.0.0.2", "10.0.0.3"])).is_none());
    }

    #[test]
    fn test_peers_for_sites() {
        let registry = registry();
        let peers = registry.peers_for(&sites(&["10.0.0.2", "edge", "10.0.0.1"])).unwrap();
        let ids: Vec<_> = peers.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 4]);

        let err = registry.peers_for(&sites(&["10.0.0.1", "nowhere"])).unwrap_err();
        assert!(matches!(err, ReplicationError::UnknownSite(site) if site == "nowhere"));
    }

    #[tokio::test]
    async fn test_open_rejects_non_member() {
        let registry = registry();
        let group = CreateGroup::new(5, vec![Peer::new(2, "10.0.0.2:7100")]);
        assert!(matches!(
            registry.open(&group).await,
            Err(ReplicationError::NotMember(5))
        ));
    }

    #[tokio::test]
    async fn test_resolve_without_bootstrap_group() {
        let registry = registry();
        let result = registry.resolve(&sites(&["10.0.0.1", "10.0.0.2", "10.0.0.3"])).await;
        assert!(matches!(result, Err(ReplicationError::UnknownGroup(BOOTSTRAP_GROUP))));
    }

    #[tokio::test]
    async fn test_wait_open_times_out() {
        let registry = registry();
        assert!(registry.wait_open(3, Duration::from_millis(60)).await.is_none());
    }
}
