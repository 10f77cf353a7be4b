//! Cheops core - operation model and consistency resolution.
//!
//! This crate holds everything that decides *what* must run on a site,
//! independent of how operations are replicated:
//!
//! - [`operation`]: operations, commands, replies and per-site resource documents
//! - [`resolution`]: the pairwise resolution matrix between operation classes
//! - [`resolver`]: the suit-based computation of operations a site still has to run
//! - [`merge`]: reconciliation of divergent histories of one resource
//! - [`executor`]: the contract for running an operation locally

pub mod error;
pub mod executor;
pub mod merge;
pub mod operation;
pub mod resolution;
pub mod resolver;

pub use error::Error;
pub use executor::{Execution, Executor};
pub use merge::{merge, splice};
pub use operation::{
    new_request_id, Command, Operation, OperationClass, ReplyDocument, ReplyStatus,
    ResourceDocument,
};
pub use resolution::{Resolution, ResolutionMatrix, ResolutionRule};
pub use resolver::{compute_operations_to_run, ReplyIndex};
