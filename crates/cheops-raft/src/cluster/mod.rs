//! Group lifecycle and orchestration.
//!
//! This module provides:
//! - [`ReplicationGroup`] - One running group member: submit, linearize, dump
//! - [`GroupRegistry`] - Site-set lookup and creation through the bootstrap group
//! - [`ReplyBus`] - Delivery of committed replies to waiting submitters
//! - [`Dispatcher`] - Local reaction to applied entries
//! - [`Node`] - The per-site orchestrator

pub mod bus;
pub mod dispatch;
pub mod group;
pub mod node;
pub mod registry;
pub mod router;

pub use bus::ReplyBus;
pub use dispatch::Dispatcher;
pub use group::{GroupRole, ReplicationGroup};
pub use node::{validate_sites, Node, ReplyStream, MIN_SITES};
pub use registry::GroupRegistry;
pub use router::LeaderRouter;
