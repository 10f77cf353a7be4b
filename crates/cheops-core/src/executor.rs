//! Local execution of operations.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::operation::{Operation, ReplyDocument, ReplyStatus};

/// Result of running one operation locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Execution {
    /// `Ok` or `Ko`.
    pub status: ReplyStatus,
    /// Captured output.
    pub output: String,
}

impl Execution {
    /// Successful execution.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            output: output.into(),
        }
    }

    /// Failed execution.
    pub fn ko(output: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Ko,
            output: output.into(),
        }
    }

    /// Turn the execution into the reply `site` records for `operation`.
    pub fn into_reply(self, site: &str, operation: &Operation) -> ReplyDocument {
        match self.status {
            ReplyStatus::Ok => ReplyDocument::ok(site, operation, self.output),
            _ => ReplyDocument::ko(site, operation, self.output),
        }
    }
}

/// Runs an operation's command on this site.
///
/// Implementations never fail: anything that prevents the command from
/// completing within `deadline` is reported as a `Ko` execution.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `operation`, bounded by `deadline`.
    async fn execute(&self, operation: &Operation, deadline: Duration) -> Execution;
}
