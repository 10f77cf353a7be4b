//! Raft state machine of one replication group.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use anyerror::AnyError;
use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{Entry, EntryPayload, LogId, OptionalSend, StorageError, StorageIOError};
use parking_lot::RwLock;
use sled::{Db, Tree};

use crate::error::ReplicationError;
use crate::storage::ledger::GroupLedger;
use crate::storage::snapshot::{load_current, save_current, SnapshotBuilder, SnapshotRestorer};
use crate::types::{
    GroupEntry, GroupId, GroupResponse, Membership, NodeId, SnapshotMeta, StoredMembership,
    TypeConfig,
};

const SM_STATE_TREE: &str = "raft_sm_state";

const KEY_LAST_APPLIED: &[u8] = b"last_applied";
const KEY_MEMBERSHIP: &[u8] = b"membership";

/// Callback fired once for every entry newly recorded in a group's ledger.
///
/// It also fires again for entries already recorded when the ledger is
/// reloaded or replaced (see [`GroupStateMachine::replay`]), so consumers must
/// tolerate seeing an entry twice. Runs inside the apply path, so
/// implementations must only hand the entry off (e.g. push it onto a channel)
/// and return.
pub type ApplyHook = Arc<dyn Fn(GroupId, &GroupEntry) + Send + Sync>;

/// Applies committed [`GroupEntry`] values to a [`GroupLedger`].
pub struct GroupStateMachine {
    group_id: GroupId,
    state_tree: Tree,
    last_applied: RwLock<Option<LogId<NodeId>>>,
    membership: RwLock<StoredMembership>,
    snapshot_dir: PathBuf,
    ledger: Arc<GroupLedger>,
    hook: Option<ApplyHook>,
}

impl GroupStateMachine {
    /// Open the state machine of `group_id` stored in `db`.
    pub fn new(group_id: GroupId, db: &Db, snapshot_dir: PathBuf) -> Result<Self, ReplicationError> {
        let state_tree = db.open_tree(SM_STATE_TREE)?;
        let last_applied = match state_tree.get(KEY_LAST_APPLIED)? {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        };
        let membership = match state_tree.get(KEY_MEMBERSHIP)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => StoredMembership::new(None, Membership::new(vec![], None)),
        };
        let ledger = Arc::new(GroupLedger::open(group_id, db)?);

        std::fs::create_dir_all(&snapshot_dir)?;

        Ok(Self {
            group_id,
            state_tree,
            last_applied: RwLock::new(last_applied),
            membership: RwLock::new(membership),
            snapshot_dir,
            ledger,
            hook: None,
        })
    }

    /// Set the callback fired for newly recorded entries.
    pub fn with_apply_hook(mut self, hook: ApplyHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// The ledger this state machine writes to.
    pub fn ledger(&self) -> Arc<GroupLedger> {
        self.ledger.clone()
    }

    /// Hand the latest operation of every resource to the hook again.
    ///
    /// Operations applied before a restart, or received inside a snapshot,
    /// may still be waiting for this site; the consumer recomputes what is
    /// pending per resource.
    pub fn replay(&self) {
        let Some(hook) = &self.hook else {
            return;
        };
        let latest = self.ledger.latest_per_resource();
        if !latest.is_empty() {
            tracing::debug!(group_id = self.group_id, resources = latest.len(), "replaying resources");
        }
        for op in latest {
            hook(self.group_id, &GroupEntry::OperationSubmitted(op));
        }
    }

    /// Get the current last applied log ID.
    pub fn last_applied(&self) -> Option<LogId<NodeId>> {
        *self.last_applied.read()
    }

    fn persist_state(&self) -> Result<(), ReplicationError> {
        if let Some(log_id) = *self.last_applied.read() {
            self.state_tree
                .insert(KEY_LAST_APPLIED, serde_json::to_vec(&log_id)?)?;
        }
        let membership = self.membership.read().clone();
        self.state_tree
            .insert(KEY_MEMBERSHIP, serde_json::to_vec(&membership)?)?;
        self.ledger.flush()?;
        self.state_tree.flush()?;
        Ok(())
    }

    /// Record one entry. Entries that cannot be recorded are logged and
    /// skipped so the rest of the log stays processable.
    fn apply_entry(&self, index: u64, entry: &GroupEntry) -> GroupResponse {
        match self.ledger.record(entry) {
            Ok(GroupResponse::Recorded) => {
                tracing::debug!(group_id = self.group_id, index, kind = entry.kind(), "entry applied");
                if let Some(hook) = &self.hook {
                    hook(self.group_id, entry);
                }
                GroupResponse::Recorded
            }
            Ok(other) => {
                tracing::debug!(
                    group_id = self.group_id,
                    index,
                    kind = entry.kind(),
                    outcome = ?other,
                    "entry not recorded"
                );
                other
            }
            Err(e) => {
                tracing::error!(
                    group_id = self.group_id,
                    index,
                    kind = entry.kind(),
                    error = %e,
                    "skipping entry"
                );
                GroupResponse::Rejected(e.to_string())
            }
        }
    }
}

impl RaftStateMachine<TypeConfig> for GroupStateMachine {
    type SnapshotBuilder = SnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership), StorageError<NodeId>> {
        Ok((*self.last_applied.read(), self.membership.read().clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<GroupResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            *self.last_applied.write() = Some(entry.log_id);

            let response = match entry.payload {
                EntryPayload::Blank => GroupResponse::Noop,
                EntryPayload::Normal(ref group_entry) => {
                    self.apply_entry(entry.log_id.index, group_entry)
                }
                EntryPayload::Membership(membership) => {
                    *self.membership.write() = StoredMembership::new(Some(entry.log_id), membership);
                    GroupResponse::Noop
                }
            };
            responses.push(response);
        }

        self.persist_state()
            .map_err(|e| StorageIOError::write_state_machine(AnyError::new(&e)))?;

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SnapshotBuilder::new(
            self.ledger.clone(),
            self.snapshot_dir.clone(),
            *self.last_applied.read(),
            self.membership.read().clone(),
        )
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        let installed = SnapshotRestorer::new(self.ledger.clone())
            .restore(&data)
            .map_err(|e| StorageIOError::write_state_machine(AnyError::new(&e)))?;
        save_current(&self.snapshot_dir, meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(None, AnyError::new(&e)))?;

        *self.last_applied.write() = meta.last_log_id;
        *self.membership.write() = meta.last_membership.clone();
        self.persist_state()
            .map_err(|e| StorageIOError::write_state_machine(AnyError::new(&e)))?;

        tracing::info!(
            group_id = self.group_id,
            snapshot_id = %meta.snapshot_id,
            operations = installed.ledger.operations.len(),
            "snapshot installed"
        );

        // Groups learned through the snapshot still have to be opened locally.
        if let Some(hook) = &self.hook {
            for group in installed.ledger.groups {
                hook(self.group_id, &GroupEntry::GroupCreated(group));
            }
        }
        self.replay();
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let current = load_current(&self.snapshot_dir)
            .map_err(|e| StorageIOError::read_snapshot(None, AnyError::new(&e)))?;
        Ok(current.map(|(meta, data)| Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CreateGroup, Peer, BOOTSTRAP_GROUP};
    use cheops_core::{Command, Operation, OperationClass, ReplyDocument};
    use openraft::RaftSnapshotBuilder;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    fn log_id(index: u64) -> LogId<NodeId> {
        LogId::new(openraft::CommittedLeaderId::new(1, 1), index)
    }

    fn normal(index: u64, entry: GroupEntry) -> Entry<TypeConfig> {
        Entry {
            log_id: log_id(index),
            payload: EntryPayload::Normal(entry),
        }
    }

    fn op(id: &str) -> Operation {
        Operation::new(id, OperationClass::Commutative, "a", "vm", Command::shell("true"))
    }

    fn open(group_id: GroupId) -> (GroupStateMachine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let sm = GroupStateMachine::new(group_id, &db, dir.path().join("snapshots")).unwrap();
        (sm, dir)
    }

    #[tokio::test]
    async fn test_apply_blank() {
        let (mut sm, _dir) = open(1);
        let entry = Entry {
            log_id: log_id(1),
            payload: EntryPayload::Blank,
        };

        let responses = sm.apply(vec![entry]).await.unwrap();
        assert_eq!(responses, vec![GroupResponse::Noop]);
        let (last_applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 1);
    }

    #[tokio::test]
    async fn test_apply_membership() {
        let (mut sm, _dir) = open(1);
        let membership = Membership::new(vec![BTreeSet::from([1, 2, 3])], None);
        let entry = Entry {
            log_id: log_id(1),
            payload: EntryPayload::Membership(membership.clone()),
        };

        sm.apply(vec![entry]).await.unwrap();
        let (_, stored) = sm.applied_state().await.unwrap();
        assert_eq!(*stored.membership(), membership);
    }

    #[tokio::test]
    async fn test_hook_fires_once_per_new_entry() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (sm, _dir) = open(3);
        let mut sm = sm.with_apply_hook(Arc::new(move |group_id, entry| {
            assert_eq!(group_id, 3);
            sink.lock().push(entry.kind().to_string());
        }));

        let operation = op("r1");
        let responses = sm
            .apply(vec![
                normal(1, GroupEntry::OperationSubmitted(operation.clone())),
                normal(2, GroupEntry::OperationSubmitted(operation.clone())),
                normal(3, GroupEntry::ReplyRecorded(ReplyDocument::ok("b", &operation, ""))),
            ])
            .await
            .unwrap();

        assert_eq!(
            responses,
            vec![
                GroupResponse::Recorded,
                GroupResponse::Duplicate,
                GroupResponse::Recorded
            ]
        );
        assert_eq!(*seen.lock(), vec!["operation", "reply"]);
    }

    #[tokio::test]
    async fn test_rejected_entry_is_skipped() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (sm, _dir) = open(4);
        let mut sm = sm.with_apply_hook(Arc::new(move |_, entry| {
            sink.lock().push(entry.kind().to_string());
        }));

        let operation = op("r1");
        let stray_group = CreateGroup::new(9, vec![Peer::new(1, "a:1")]);
        let responses = sm
            .apply(vec![
                normal(1, GroupEntry::GroupCreated(stray_group)),
                normal(2, GroupEntry::ReplyRecorded(ReplyDocument::timeout("b", "r1", "vm"))),
                normal(3, GroupEntry::OperationSubmitted(operation.clone())),
            ])
            .await
            .unwrap();

        assert!(matches!(responses[0], GroupResponse::Rejected(_)));
        assert!(matches!(responses[1], GroupResponse::Rejected(_)));
        assert_eq!(responses[2], GroupResponse::Recorded);
        assert_eq!(*seen.lock(), vec!["operation"]);
        assert_eq!(sm.last_applied().unwrap().index, 3);
        assert!(sm.ledger().groups().is_empty());
        assert!(sm.ledger().replies_for("r1").is_empty());
    }

    #[tokio::test]
    async fn test_replay_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path().join("db")).unwrap();
            let mut sm =
                GroupStateMachine::new(2, &db, dir.path().join("snapshots")).unwrap();
            let mut on_db = op("r3");
            on_db.resource_id = "db".to_string();
            sm.apply(vec![
                normal(1, GroupEntry::OperationSubmitted(op("r1"))),
                normal(2, GroupEntry::OperationSubmitted(op("r2"))),
                normal(3, GroupEntry::OperationSubmitted(on_db)),
            ])
            .await
            .unwrap();
        }

        let replayed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = replayed.clone();
        let db = sled::open(dir.path().join("db")).unwrap();
        let sm = GroupStateMachine::new(2, &db, dir.path().join("snapshots"))
            .unwrap()
            .with_apply_hook(Arc::new(move |group_id, entry| {
                assert_eq!(group_id, 2);
                if let GroupEntry::OperationSubmitted(op) = entry {
                    sink.lock().push(op.request_id.clone());
                }
            }));

        sm.replay();
        assert_eq!(*replayed.lock(), vec!["r2", "r3"]);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path().join("db")).unwrap();
            let mut sm =
                GroupStateMachine::new(2, &db, dir.path().join("snapshots")).unwrap();
            sm.apply(vec![normal(5, GroupEntry::OperationSubmitted(op("r1")))])
                .await
                .unwrap();
        }

        let db = sled::open(dir.path().join("db")).unwrap();
        let mut sm = GroupStateMachine::new(2, &db, dir.path().join("snapshots")).unwrap();
        let (last_applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 5);
        assert!(sm.ledger().operation("r1").is_some());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_reopens_groups() {
        let (mut source, _a) = open(BOOTSTRAP_GROUP);
        let group = CreateGroup::new(
            1,
            vec![Peer::new(1, "a:1"), Peer::new(2, "b:1"), Peer::new(3, "c:1")],
        );
        source
            .apply(vec![
                normal(1, GroupEntry::GroupCreated(group.clone())),
                normal(2, GroupEntry::OperationSubmitted(op("r1"))),
            ])
            .await
            .unwrap();
        let snapshot = source.get_snapshot_builder().await.build_snapshot().await.unwrap();

        let created: Arc<Mutex<Vec<CreateGroup>>> = Arc::new(Mutex::new(Vec::new()));
        let replayed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let (groups_sink, ops_sink) = (created.clone(), replayed.clone());
        let (target, _b) = open(BOOTSTRAP_GROUP);
        let mut target = target.with_apply_hook(Arc::new(move |_, entry| match entry {
            GroupEntry::GroupCreated(g) => groups_sink.lock().push(g.clone()),
            GroupEntry::OperationSubmitted(op) => ops_sink.lock().push(op.request_id.clone()),
            GroupEntry::ReplyRecorded(_) => {}
        }));

        target
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert_eq!(*created.lock(), vec![group]);
        assert_eq!(*replayed.lock(), vec!["r1"]);
        let (last_applied, _) = target.applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 2);
        assert!(target.get_current_snapshot().await.unwrap().is_some());
    }
}
