//! Storage implementations for Raft.
//!
//! This module provides:
//! - [`SledRaftLogStorage`] - Persistent log storage using sled
//! - [`GroupStateMachine`] - State machine applying entries to a group ledger
//! - [`GroupLedger`] - Applied operations, replies and the group catalog
//! - Snapshot building and restoration

pub mod ledger;
pub mod log_storage;
pub mod snapshot;
pub mod state_machine;

pub use ledger::{GroupLedger, LedgerSnapshot};
pub use log_storage::SledRaftLogStorage;
pub use snapshot::{SnapshotBuilder, SnapshotData, SnapshotRestorer};
pub use state_machine::{ApplyHook, GroupStateMachine};
