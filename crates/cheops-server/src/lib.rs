//! Cheops server library.
//!
//! Wires a replication [`cheops_raft::Node`] to the shell execution backend
//! and exposes the management and submission endpoint.

pub mod api;
pub mod config;
pub mod error;
pub mod exec;
pub mod handler;

pub use api::{ApiMetrics, ApiServer};
pub use config::{parse_peer, Args, ServerConfig};
pub use error::Error;
pub use exec::ShellExecutor;
pub use handler::{ApiRequest, ApiResponse, RequestHandler};
