//! Network transport implementations for Raft.
//!
//! This module provides:
//! - [`NngRaftNetwork`] - Network client for sending group RPCs
//! - [`NngNetworkFactory`] - Factory for creating network connections
//! - [`RaftTransport`] - Server receiving RPCs for every local group
//! - Wire message types

pub mod factory;
pub mod messages;
pub mod server;
pub mod transport;

pub use factory::NngNetworkFactory;
pub use messages::{ForwardedWrite, RaftEnvelope, RaftMessage, WriteRejection};
pub use server::{GroupTable, RaftTransport};
pub use transport::{send_envelope, NngRaftNetwork};
