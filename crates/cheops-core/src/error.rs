//! Core error types.

use thiserror::Error;

/// Errors raised while building or parsing core values.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown operation class name.
    #[error("invalid operation class: {0}")]
    InvalidClass(String),

    /// Unknown reply status name.
    #[error("invalid reply status: {0}")]
    InvalidStatus(String),

    /// A resolution matrix could not be loaded.
    #[error("invalid resolution matrix: {0}")]
    InvalidMatrix(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
