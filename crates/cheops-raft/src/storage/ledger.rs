//! Applied state of one replication group.
//!
//! The ledger is what the state machine builds from committed entries:
//! operations in commit order, at most one reply per `(request, site)`, and,
//! for the bootstrap group, the catalog of declared groups. Every record is
//! written through to sled so the ledger survives restarts without replaying
//! the log.

use std::collections::{BTreeMap, HashMap};

use cheops_core::{Operation, ReplyDocument, ReplyStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::ReplicationError;
use crate::types::{CreateGroup, GroupEntry, GroupId, GroupResponse, LogDump, BOOTSTRAP_GROUP};

const OPERATIONS_TREE: &str = "ledger_operations";
const REPLIES_TREE: &str = "ledger_replies";
const GROUPS_TREE: &str = "ledger_groups";

/// Serializable image of a ledger, used for snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Operations in commit order.
    pub operations: Vec<Operation>,
    /// All recorded replies.
    pub replies: Vec<ReplyDocument>,
    /// Declared groups.
    pub groups: Vec<CreateGroup>,
}

/// Applied operations, replies and group catalog of one group.
pub struct GroupLedger {
    group_id: GroupId,
    operations: Mutex<Vec<Operation>>,
    /// Position of every operation in `operations`, by request id.
    positions: Mutex<HashMap<String, usize>>,
    replies: Mutex<HashMap<String, BTreeMap<String, ReplyDocument>>>,
    groups: Mutex<BTreeMap<GroupId, CreateGroup>>,
    operations_tree: Tree,
    replies_tree: Tree,
    groups_tree: Tree,
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ReplicationError> {
    serde_json::from_slice(bytes).map_err(|e| ReplicationError::Storage(e.to_string()))
}

fn index_positions(operations: &[Operation]) -> HashMap<String, usize> {
    operations
        .iter()
        .enumerate()
        .map(|(i, op)| (op.request_id.clone(), i))
        .collect()
}

fn reply_key(request_id: &str, site: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(request_id.len() + site.len() + 1);
    key.extend_from_slice(request_id.as_bytes());
    key.push(0);
    key.extend_from_slice(site.as_bytes());
    key
}

impl GroupLedger {
    /// Open the ledger stored in `db`, loading everything already recorded.
    pub fn open(group_id: GroupId, db: &Db) -> Result<Self, ReplicationError> {
        let operations_tree = db.open_tree(OPERATIONS_TREE)?;
        let replies_tree = db.open_tree(REPLIES_TREE)?;
        let groups_tree = db.open_tree(GROUPS_TREE)?;

        let mut operations = Vec::new();
        for item in operations_tree.iter() {
            let (_, value) = item?;
            operations.push(decode::<Operation>(&value)?);
        }
        let positions = index_positions(&operations);

        let mut replies: HashMap<String, BTreeMap<String, ReplyDocument>> = HashMap::new();
        for item in replies_tree.iter() {
            let (_, value) = item?;
            let reply: ReplyDocument = decode(&value)?;
            replies
                .entry(reply.request_id.clone())
                .or_default()
                .insert(reply.site.clone(), reply);
        }

        let mut groups = BTreeMap::new();
        for item in groups_tree.iter() {
            let (_, value) = item?;
            let group: CreateGroup = decode(&value)?;
            groups.insert(group.group_id, group);
        }

        tracing::debug!(
            group_id,
            operations = operations.len(),
            groups = groups.len(),
            "ledger loaded"
        );

        Ok(Self {
            group_id,
            operations: Mutex::new(operations),
            positions: Mutex::new(positions),
            replies: Mutex::new(replies),
            groups: Mutex::new(groups),
            operations_tree,
            replies_tree,
            groups_tree,
        })
    }

    /// The group this ledger belongs to.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Record a committed entry.
    pub fn record(&self, entry: &GroupEntry) -> Result<GroupResponse, ReplicationError> {
        match entry {
            GroupEntry::OperationSubmitted(op) => self.record_operation(op),
            GroupEntry::ReplyRecorded(reply) => self.record_reply(reply),
            GroupEntry::GroupCreated(group) => self.record_group(group),
        }
    }

    fn record_operation(&self, op: &Operation) -> Result<GroupResponse, ReplicationError> {
        let mut operations = self.operations.lock();
        let mut positions = self.positions.lock();
        if positions.contains_key(&op.request_id) {
            return Ok(GroupResponse::Duplicate);
        }
        let position = operations.len();
        self.operations_tree
            .insert((position as u64).to_be_bytes(), serde_json::to_vec(op)?)?;
        positions.insert(op.request_id.clone(), position);
        operations.push(op.clone());
        Ok(GroupResponse::Recorded)
    }

    fn record_reply(&self, reply: &ReplyDocument) -> Result<GroupResponse, ReplicationError> {
        if reply.status == ReplyStatus::Timeout {
            return Ok(GroupResponse::Rejected(
                "timeout replies are not recorded".to_string(),
            ));
        }
        let mut replies = self.replies.lock();
        let by_site = replies.entry(reply.request_id.clone()).or_default();
        if by_site.contains_key(&reply.site) {
            return Ok(GroupResponse::Duplicate);
        }
        self.replies_tree.insert(
            reply_key(&reply.request_id, &reply.site),
            serde_json::to_vec(reply)?,
        )?;
        by_site.insert(reply.site.clone(), reply.clone());
        Ok(GroupResponse::Recorded)
    }

    fn record_group(&self, group: &CreateGroup) -> Result<GroupResponse, ReplicationError> {
        if self.group_id != BOOTSTRAP_GROUP {
            return Ok(GroupResponse::Rejected(format!(
                "group {} does not hold the group catalog",
                self.group_id
            )));
        }
        if group.peers.is_empty() {
            return Ok(GroupResponse::Rejected("group has no peers".to_string()));
        }

        let mut groups = self.groups.lock();
        if groups.get(&group.group_id) == Some(group) {
            return Ok(GroupResponse::Duplicate);
        }
        if group.group_id == BOOTSTRAP_GROUP || groups.contains_key(&group.group_id) {
            return Ok(GroupResponse::Rejected(format!(
                "group id {} is taken",
                group.group_id
            )));
        }
        let sites = group.sites();
        if let Some(existing) = groups.values().find(|g| g.sites() == sites) {
            return Ok(GroupResponse::GroupExists(existing.group_id));
        }

        self.groups_tree
            .insert(group.group_id.to_be_bytes(), serde_json::to_vec(group)?)?;
        groups.insert(group.group_id, group.clone());
        Ok(GroupResponse::Recorded)
    }

    /// Operations on `resource_id`, in commit order.
    pub fn history(&self, resource_id: &str) -> Vec<Operation> {
        self.operations
            .lock()
            .iter()
            .filter(|op| op.resource_id == resource_id)
            .cloned()
            .collect()
    }

    /// Every reply recorded for operations on `resource_id`.
    pub fn replies_for_resource(&self, resource_id: &str) -> Vec<ReplyDocument> {
        self.replies
            .lock()
            .values()
            .flat_map(|by_site| by_site.values())
            .filter(|reply| reply.resource_id == resource_id)
            .cloned()
            .collect()
    }

    /// Replies recorded for one operation, ordered by site.
    pub fn replies_for(&self, request_id: &str) -> Vec<ReplyDocument> {
        self.replies
            .lock()
            .get(request_id)
            .map(|by_site| by_site.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Look up an operation.
    pub fn operation(&self, request_id: &str) -> Option<Operation> {
        let operations = self.operations.lock();
        let position = *self.positions.lock().get(request_id)?;
        operations.get(position).cloned()
    }

    /// Latest operation on every resource, in order of first appearance.
    pub fn latest_per_resource(&self) -> Vec<Operation> {
        let operations = self.operations.lock();
        let mut order: Vec<&str> = Vec::new();
        let mut latest: HashMap<&str, &Operation> = HashMap::new();
        for op in operations.iter() {
            if latest.insert(op.resource_id.as_str(), op).is_none() {
                order.push(op.resource_id.as_str());
            }
        }
        order
            .into_iter()
            .filter_map(|resource| latest.get(resource).map(|op| (*op).clone()))
            .collect()
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    /// Whether no operation has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declared groups, ordered by id.
    pub fn groups(&self) -> Vec<CreateGroup> {
        self.groups.lock().values().cloned().collect()
    }

    /// Operations with their replies, in commit order.
    pub fn dump(&self) -> Vec<LogDump> {
        let operations = self.operations.lock();
        let replies = self.replies.lock();
        operations
            .iter()
            .map(|op| LogDump {
                request: op.clone(),
                replies: replies
                    .get(&op.request_id)
                    .map(|by_site| by_site.values().cloned().collect())
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Image of the whole ledger.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let operations = self.operations.lock();
        let replies = self.replies.lock();
        let groups = self.groups.lock();
        LedgerSnapshot {
            operations: operations.clone(),
            replies: replies
                .values()
                .flat_map(|by_site| by_site.values().cloned())
                .collect(),
            groups: groups.values().cloned().collect(),
        }
    }

    /// Replace the whole ledger with `snapshot`.
    pub fn restore(&self, snapshot: LedgerSnapshot) -> Result<(), ReplicationError> {
        let mut operations = self.operations.lock();
        let mut positions = self.positions.lock();
        let mut replies = self.replies.lock();
        let mut groups = self.groups.lock();

        self.operations_tree.clear()?;
        self.replies_tree.clear()?;
        self.groups_tree.clear()?;

        for (i, op) in snapshot.operations.iter().enumerate() {
            self.operations_tree
                .insert((i as u64).to_be_bytes(), serde_json::to_vec(op)?)?;
        }
        replies.clear();
        for reply in snapshot.replies {
            self.replies_tree.insert(
                reply_key(&reply.request_id, &reply.site),
                serde_json::to_vec(&reply)?,
            )?;
            replies
                .entry(reply.request_id.clone())
                .or_default()
                .insert(reply.site.clone(), reply);
        }
        groups.clear();
        for group in snapshot.groups {
            self.groups_tree
                .insert(group.group_id.to_be_bytes(), serde_json::to_vec(&group)?)?;
            groups.insert(group.group_id, group);
        }
        *positions = index_positions(&snapshot.operations);
        *operations = snapshot.operations;

        self.flush()
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), ReplicationError> {
        self.operations_tree.flush()?;
        self.replies_tree.flush()?;
        self.groups_tree.flush()?;
        Ok(())
    }
}
