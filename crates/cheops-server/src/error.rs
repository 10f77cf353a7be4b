//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Replication layer error.
    #[error("replication error: {0}")]
    Replication(#[from] cheops_raft::ReplicationError),

    /// Operation model error.
    #[error("{0}")]
    Core(#[from] cheops_core::Error),

    /// Malformed request or response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
