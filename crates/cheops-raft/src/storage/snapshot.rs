//! Snapshot building, persistence and restoration for group ledgers.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyerror::AnyError;
use openraft::storage::{RaftSnapshotBuilder, Snapshot};
use openraft::{LogId, StorageError, StorageIOError};
use serde::{Deserialize, Serialize};

use crate::error::ReplicationError;
use crate::storage::ledger::{GroupLedger, LedgerSnapshot};
use crate::types::{GroupId, NodeId, SnapshotMeta, StoredMembership, TypeConfig};

const SNAPSHOT_FORMAT_VERSION: u32 = 1;
const CURRENT_META: &str = "current.meta";
const CURRENT_DATA: &str = "current.snap";

/// On-disk and on-wire snapshot payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Snapshot format version.
    pub version: u32,
    /// Group the snapshot belongs to.
    pub group_id: GroupId,
    /// Last log index included in the snapshot.
    pub last_log_index: u64,
    /// The applied ledger.
    pub ledger: LedgerSnapshot,
}

impl SnapshotData {
    /// Decode a snapshot payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicationError> {
        let data: Self = serde_json::from_slice(bytes)
            .map_err(|e| ReplicationError::Snapshot(format!("invalid snapshot: {}", e)))?;
        if data.version != SNAPSHOT_FORMAT_VERSION {
            return Err(ReplicationError::Snapshot(format!(
                "unsupported snapshot version {}",
                data.version
            )));
        }
        Ok(data)
    }
}

/// Builds snapshots of a group ledger at the last applied log position.
pub struct SnapshotBuilder {
    group_id: GroupId,
    ledger: Arc<GroupLedger>,
    snapshot_dir: PathBuf,
    last_applied: Option<LogId<NodeId>>,
    membership: StoredMembership,
}

impl SnapshotBuilder {
    /// Create a new snapshot builder.
    pub fn new(
        ledger: Arc<GroupLedger>,
        snapshot_dir: PathBuf,
        last_applied: Option<LogId<NodeId>>,
        membership: StoredMembership,
    ) -> Self {
        Self {
            group_id: ledger.group_id(),
            ledger,
            snapshot_dir,
            last_applied,
            membership,
        }
    }

    fn snapshot_id(&self) -> String {
        let index = self.last_applied.map(|l| l.index).unwrap_or(0);
        format!(
            "snap-{}-{}-{}",
            self.group_id,
            index,
            chrono::Utc::now().timestamp_millis()
        )
    }

    fn build_data(&self) -> Result<Vec<u8>, ReplicationError> {
        let data = SnapshotData {
            version: SNAPSHOT_FORMAT_VERSION,
            group_id: self.group_id,
            last_log_index: self.last_applied.map(|l| l.index).unwrap_or(0),
            ledger: self.ledger.snapshot(),
        };
        Ok(serde_json::to_vec(&data)?)
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let meta: SnapshotMeta = openraft::SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.membership.clone(),
            snapshot_id: self.snapshot_id(),
        };

        let data = self
            .build_data()
            .map_err(|e| StorageIOError::write_snapshot(None, AnyError::new(&e)))?;
        save_current(&self.snapshot_dir, &meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(None, AnyError::new(&e)))?;

        tracing::info!(
            group_id = self.group_id,
            snapshot_id = %meta.snapshot_id,
            bytes = data.len(),
            "snapshot built"
        );

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

/// Persist `data` as the current snapshot in `dir`.
pub fn save_current(dir: &Path, meta: &SnapshotMeta, data: &[u8]) -> Result<(), ReplicationError> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(CURRENT_DATA), data)?;
    std::fs::write(dir.join(CURRENT_META), serde_json::to_vec(meta)?)?;
    Ok(())
}

/// Load the current snapshot from `dir`, if one was saved.
pub fn load_current(dir: &Path) -> Result<Option<(SnapshotMeta, Vec<u8>)>, ReplicationError> {
    let meta_path = dir.join(CURRENT_META);
    let data_path = dir.join(CURRENT_DATA);
    if !meta_path.exists() || !data_path.exists() {
        return Ok(None);
    }
    let meta: SnapshotMeta = serde_json::from_slice(&std::fs::read(meta_path)?)?;
    let data = std::fs::read(data_path)?;
    Ok(Some((meta, data)))
}

/// Replace the contents of a ledger with a received snapshot.
pub struct SnapshotRestorer {
    ledger: Arc<GroupLedger>,
}

impl SnapshotRestorer {
    /// Create a restorer for `ledger`.
    pub fn new(ledger: Arc<GroupLedger>) -> Self {
        Self { ledger }
    }

    /// Restore from an encoded snapshot and return what was installed.
    pub fn restore(&self, bytes: &[u8]) -> Result<SnapshotData, ReplicationError> {
        let data = SnapshotData::decode(bytes)?;
        if data.group_id != self.ledger.group_id() {
            return Err(ReplicationError::Snapshot(format!(
                "snapshot of group {} offered to group {}",
                data.group_id,
                self.ledger.group_id()
            )));
        }
        self.ledger.restore(data.ledger.clone())?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupEntry, Membership};
    use cheops_core::{Command, Operation, OperationClass};
    use std::collections::BTreeSet;

    fn ledger(group_id: GroupId) -> Arc<GroupLedger> {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Arc::new(GroupLedger::open(group_id, &db).unwrap())
    }

    fn membership() -> StoredMembership {
        StoredMembership::new(None, Membership::new(vec![BTreeSet::from([1, 2, 3])], None))
    }

    #[tokio::test]
    async fn test_build_and_restore() {
        let source = ledger(2);
        let op = Operation::new("r1", OperationClass::Idempotent, "a", "vm", Command::shell("true"));
        source.record(&GroupEntry::OperationSubmitted(op)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let last = LogId::new(openraft::CommittedLeaderId::new(1, 1), 9);
        let mut builder =
            SnapshotBuilder::new(source.clone(), dir.path().to_path_buf(), Some(last), membership());
        let snapshot = builder.build_snapshot().await.unwrap();
        assert!(snapshot.meta.snapshot_id.starts_with("snap-2-9-"));

        let (meta, data) = load_current(dir.path()).unwrap().unwrap();
        assert_eq!(meta.last_log_id, Some(last));

        let target = ledger(2);
        let restored = SnapshotRestorer::new(target.clone()).restore(&data).unwrap();
        assert_eq!(restored.last_log_index, 9);
        assert!(target.operation("r1").is_some());
    }

    #[test]
    fn test_restore_rejects_other_group() {
        let source = ledger(1);
        let data = serde_json::to_vec(&SnapshotData {
            version: SNAPSHOT_FORMAT_VERSION,
            group_id: 1,
            last_log_index: 0,
            ledger: source.snapshot(),
        })
        .unwrap();

        let err = SnapshotRestorer::new(ledger(4)).restore(&data).unwrap_err();
        assert!(matches!(err, ReplicationError::Snapshot(_)));
    }

    #[test]
    fn test_load_current_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_current(dir.path()).unwrap().is_none());
    }
}
