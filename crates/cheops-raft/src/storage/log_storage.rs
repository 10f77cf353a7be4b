//! Per-group Raft log storage using sled.

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use anyerror::AnyError;
use openraft::storage::{LogFlushed, RaftLogReader, RaftLogStorage};
use openraft::{Entry, LogId, LogState, OptionalSend, StorageError, StorageIOError, Vote};
use parking_lot::RwLock;
use sled::{Batch, Db, Tree};

use crate::error::ReplicationError;
use crate::types::{GroupId, NodeId, TypeConfig};

const RAFT_LOG_TREE: &str = "raft_log";
const RAFT_VOTE_TREE: &str = "raft_vote";
const RAFT_STATE_TREE: &str = "raft_state";

const KEY_VOTE: &[u8] = b"vote";
const KEY_LAST_PURGED: &[u8] = b"last_purged_log_id";

/// Raft log of one replication group, backed by the group's sled database.
///
/// Entries live in `raft_log` keyed by big-endian index, so sled's ordering
/// is log order. The vote and the last purged log id are kept in their own
/// trees.
pub struct SledRaftLogStorage {
    group_id: GroupId,
    db: Arc<Db>,
    log_tree: Tree,
    vote_tree: Tree,
    state_tree: Tree,
    last_purged: Arc<RwLock<Option<LogId<NodeId>>>>,
}

impl SledRaftLogStorage {
    /// Open or create the log of `group_id` in `db`.
    pub fn open(group_id: GroupId, db: Arc<Db>) -> Result<Self, ReplicationError> {
        let log_tree = db.open_tree(RAFT_LOG_TREE)?;
        let vote_tree = db.open_tree(RAFT_VOTE_TREE)?;
        let state_tree = db.open_tree(RAFT_STATE_TREE)?;

        let last_purged = match state_tree.get(KEY_LAST_PURGED)? {
            Some(bytes) => Some(decode::<LogId<NodeId>>(&bytes)?),
            None => None,
        };

        Ok(Self {
            group_id,
            db,
            log_tree,
            vote_tree,
            state_tree,
            last_purged: Arc::new(RwLock::new(last_purged)),
        })
    }

    fn log_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    fn last_log_id(&self) -> Result<Option<LogId<NodeId>>, ReplicationError> {
        match self.log_tree.last()? {
            Some((_, value)) => Ok(Some(decode::<Entry<TypeConfig>>(&value)?.log_id)),
            None => Ok(None),
        }
    }

    /// Remove every entry whose key falls in `range`.
    fn remove_range<R: RangeBounds<[u8; 8]>>(&self, range: R) -> Result<usize, ReplicationError> {
        let mut batch = Batch::default();
        let mut removed = 0;
        for item in self.log_tree.range(range) {
            let (key, _) = item?;
            batch.remove(key);
            removed += 1;
        }
        self.log_tree.apply_batch(batch)?;
        Ok(removed)
    }
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ReplicationError> {
    serde_json::from_slice(bytes).map_err(|e| ReplicationError::Storage(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ReplicationError> {
    serde_json::to_vec(value).map_err(|e| ReplicationError::Serialization(e.to_string()))
}

impl RaftLogReader<TypeConfig> for SledRaftLogStorage {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            Bound::Included(&i) => Self::log_key(i),
            Bound::Excluded(&i) => Self::log_key(i.saturating_add(1)),
            Bound::Unbounded => Self::log_key(0),
        };
        let iter = match range.end_bound() {
            Bound::Included(&i) => self.log_tree.range(start..=Self::log_key(i)),
            Bound::Excluded(&i) => self.log_tree.range(start..Self::log_key(i)),
            Bound::Unbounded => self.log_tree.range(start..),
        };

        let mut entries = Vec::new();
        for item in iter {
            let (_, value) = item.map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;
            let entry = decode::<Entry<TypeConfig>>(&value)
                .map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for SledRaftLogStorage {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged_log_id = *self.last_purged.read();
        let last_log_id = self
            .last_log_id()
            .map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?
            .or(last_purged_log_id);

        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        Self {
            group_id: self.group_id,
            db: self.db.clone(),
            log_tree: self.log_tree.clone(),
            vote_tree: self.vote_tree.clone(),
            state_tree: self.state_tree.clone(),
            last_purged: self.last_purged.clone(),
        }
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = encode(vote).map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        self.vote_tree
            .insert(KEY_VOTE, bytes)
            .map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        self.vote_tree
            .flush()
            .map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        tracing::trace!(group_id = self.group_id, ?vote, "vote saved");
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        let bytes = self
            .vote_tree
            .get(KEY_VOTE)
            .map_err(|e| StorageIOError::read_vote(AnyError::new(&e)))?;
        match bytes {
            Some(bytes) => {
                let vote = decode::<Vote<NodeId>>(&bytes)
                    .map_err(|e| StorageIOError::read_vote(AnyError::new(&e)))?;
                Ok(Some(vote))
            }
            None => Ok(None),
        }
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut batch = Batch::default();
        for entry in entries {
            let value = encode(&entry).map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
            batch.insert(Self::log_key(entry.log_id.index).to_vec(), value);
        }
        self.log_tree
            .apply_batch(batch)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;

        let flushed = self
            .log_tree
            .flush()
            .map(|_| ())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        let failed = flushed.as_ref().err().map(|e| AnyError::new(e));
        callback.log_io_completed(flushed);

        match failed {
            Some(e) => Err(StorageIOError::write_logs(e).into()),
            None => Ok(()),
        }
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let removed = self
            .remove_range(Self::log_key(log_id.index)..)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        tracing::debug!(group_id = self.group_id, since = log_id.index, removed, "log truncated");
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = encode(&log_id).map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        self.state_tree
            .insert(KEY_LAST_PURGED, bytes)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        *self.last_purged.write() = Some(log_id);

        let removed = self
            .remove_range(..=Self::log_key(log_id.index))
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        tracing::debug!(group_id = self.group_id, upto = log_id.index, removed, "log purged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupEntry;
    use cheops_core::ReplyDocument;
    use openraft::EntryPayload;

    fn test_entry(index: u64, term: u64) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(openraft::CommittedLeaderId::new(term, 1), index),
            payload: EntryPayload::Normal(GroupEntry::ReplyRecorded(ReplyDocument::timeout(
                "a",
                &format!("r{index}"),
                "vm",
            ))),
        }
    }

    /// Insert entries without going through `append`, which needs a `LogFlushed`.
    fn insert_entries_directly(storage: &SledRaftLogStorage, entries: &[Entry<TypeConfig>]) {
        for entry in entries {
            let key = SledRaftLogStorage::log_key(entry.log_id.index);
            storage.log_tree.insert(key, encode(entry).unwrap()).unwrap();
        }
        storage.log_tree.flush().unwrap();
    }

    fn open_temp() -> SledRaftLogStorage {
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        SledRaftLogStorage::open(1, db).unwrap()
    }

    #[tokio::test]
    async fn test_read_range() {
        let mut storage = open_temp();
        let entries: Vec<_> = (1..=5).map(|i| test_entry(i, 1)).collect();
        insert_entries_directly(&storage, &entries);

        let read = storage.try_get_log_entries(2..4).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].log_id.index, 2);

        let read = storage.try_get_log_entries(3..=5).await.unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[2].log_id.index, 5);

        assert_eq!(storage.try_get_log_entries(..).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_entries_keep_payload() {
        let mut storage = open_temp();
        insert_entries_directly(&storage, &[test_entry(7, 2)]);

        let read = storage.try_get_log_entries(7..8).await.unwrap();
        match &read[0].payload {
            EntryPayload::Normal(GroupEntry::ReplyRecorded(reply)) => {
                assert_eq!(reply.request_id, "r7")
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncate() {
        let mut storage = open_temp();
        let entries: Vec<_> = (1..=4).map(|i| test_entry(i, 1)).collect();
        insert_entries_directly(&storage, &entries);

        let log_id = LogId::new(openraft::CommittedLeaderId::new(1, 1), 3);
        storage.truncate(log_id).await.unwrap();

        let read = storage.try_get_log_entries(1..).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(storage.get_log_state().await.unwrap().last_log_id.unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_purge() {
        let mut storage = open_temp();
        let entries: Vec<_> = (1..=4).map(|i| test_entry(i, 1)).collect();
        insert_entries_directly(&storage, &entries);

        let log_id = LogId::new(openraft::CommittedLeaderId::new(1, 1), 2);
        storage.purge(log_id).await.unwrap();

        let read = storage.try_get_log_entries(1..).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].log_id.index, 3);

        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(log_id));
        assert_eq!(state.last_log_id.unwrap().index, 4);
    }

    #[tokio::test]
    async fn test_purge_everything_keeps_last_log_id() {
        let mut storage = open_temp();
        insert_entries_directly(&storage, &[test_entry(1, 1), test_entry(2, 1)]);

        let log_id = LogId::new(openraft::CommittedLeaderId::new(1, 1), 2);
        storage.purge(log_id).await.unwrap();

        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id));
    }

    #[tokio::test]
    async fn test_vote_persistence() {
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        let mut storage = SledRaftLogStorage::open(0, db.clone()).unwrap();
        assert!(storage.read_vote().await.unwrap().is_none());

        let vote = Vote::new(1, 5);
        storage.save_vote(&vote).await.unwrap();
        assert_eq!(storage.read_vote().await.unwrap(), Some(vote));

        drop(storage);
        let mut reopened = SledRaftLogStorage::open(0, db).unwrap();
        assert_eq!(reopened.read_vote().await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn test_reader_sees_purge() {
        let mut storage = open_temp();
        insert_entries_directly(&storage, &[test_entry(1, 1), test_entry(2, 1)]);
        let mut reader = storage.get_log_reader().await;

        let log_id = LogId::new(openraft::CommittedLeaderId::new(1, 1), 1);
        storage.purge(log_id).await.unwrap();

        assert_eq!(reader.try_get_log_entries(..).await.unwrap().len(), 1);
        assert_eq!(*reader.last_purged.read(), Some(log_id));
    }
}
