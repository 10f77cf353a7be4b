//! Operations, replies and resource documents.
//!
//! Field names on the wire are PascalCase (`RequestId`, `ResourceId`, ...)
//! because these values travel through the management API and the group logs
//! unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Number of random bytes in a generated request id.
const REQUEST_ID_BYTES: usize = 16;

/// Generate a fresh, globally unique request id (hex encoded).
pub fn new_request_id() -> String {
    let mut bytes = [0u8; REQUEST_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Semantic class of an operation.
///
/// The class tells the resolver how an operation composes with its
/// neighbours in a resource history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationClass {
    /// Order-insensitive delta (e.g. an increment).
    Commutative,
    /// Resets state regardless of prior history (a checkpoint).
    Idempotent,
    /// Both: a checkpoint that may also be reordered with its peers.
    CommutativeIdempotent,
}

impl OperationClass {
    /// Whether this operation acts as a checkpoint.
    pub fn is_idempotent(self) -> bool {
        matches!(self, Self::Idempotent | Self::CommutativeIdempotent)
    }

    /// Whether this operation can be reordered with commutative peers.
    pub fn is_commutative(self) -> bool {
        matches!(self, Self::Commutative | Self::CommutativeIdempotent)
    }

    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commutative => "commutative",
            Self::Idempotent => "idempotent",
            Self::CommutativeIdempotent => "commutative-idempotent",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "commutative" => Ok(Self::Commutative),
            "idempotent" => Ok(Self::Idempotent),
            "commutativeidempotent" => Ok(Self::CommutativeIdempotent),
            _ => Err(Error::InvalidClass(s.to_string())),
        }
    }
}

/// Opaque command executed on each site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Command {
    /// Shell script to run.
    pub script: String,
    /// Auxiliary files made available to the script, by name.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl Command {
    /// Command that runs a single script with no auxiliary files.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            files: BTreeMap::new(),
        }
    }

    /// Attach an auxiliary file.
    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(name.into(), contents.into());
        self
    }
}

/// A unit of work submitted against a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Operation {
    /// Globally unique request id; also the deterministic tie-breaker.
    pub request_id: String,
    /// Semantic class.
    #[serde(rename = "Type")]
    pub class: OperationClass,
    /// Site that originated the operation.
    pub site: String,
    /// Resource the operation applies to.
    pub resource_id: String,
    /// What to run.
    pub command: Command,
    /// Submission time.
    pub time: DateTime<Utc>,
    /// Version counter of the resource unit, used by the set-union merge.
    #[serde(default)]
    pub generation: u64,
}

impl Operation {
    /// Create an operation stamped with the current time and generation 0.
    pub fn new(
        request_id: impl Into<String>,
        class: OperationClass,
        site: impl Into<String>,
        resource_id: impl Into<String>,
        command: Command,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            class,
            site: site.into(),
            resource_id: resource_id.into(),
            command,
            time: Utc::now(),
            generation: 0,
        }
    }

    /// Set the generation.
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Set the submission time.
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }
}

/// Outcome of running an operation on one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// The command succeeded.
    #[serde(rename = "OK")]
    Ok,
    /// The command failed (or could not be run).
    #[serde(rename = "KO")]
    Ko,
    /// No reply arrived in time; only ever synthesized for a waiting caller.
    #[serde(rename = "TIMEOUT")]
    Timeout,
}

impl ReplyStatus {
    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Ko => "KO",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplyStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OK" => Ok(Self::Ok),
            "KO" => Ok(Self::Ko),
            "TIMEOUT" => Ok(Self::Timeout),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

/// A site's outcome for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplyDocument {
    /// Replying site.
    pub site: String,
    /// Operation the reply is for.
    pub request_id: String,
    /// Resource of the operation.
    pub resource_id: String,
    /// Outcome.
    pub status: ReplyStatus,
    /// Captured output of the command.
    #[serde(default)]
    pub output: String,
    /// Script that was run.
    #[serde(default)]
    pub input: String,
    /// When the command finished on the replying site.
    #[serde(default)]
    pub execution_time: Option<DateTime<Utc>>,
}

impl ReplyDocument {
    fn for_operation(site: &str, operation: &Operation, status: ReplyStatus, output: String) -> Self {
        Self {
            site: site.to_string(),
            request_id: operation.request_id.clone(),
            resource_id: operation.resource_id.clone(),
            status,
            output,
            input: operation.command.script.clone(),
            execution_time: Some(Utc::now()),
        }
    }

    /// Successful reply from `site`.
    pub fn ok(site: &str, operation: &Operation, output: impl Into<String>) -> Self {
        Self::for_operation(site, operation, ReplyStatus::Ok, output.into())
    }

    /// Failed reply from `site`.
    pub fn ko(site: &str, operation: &Operation, output: impl Into<String>) -> Self {
        Self::for_operation(site, operation, ReplyStatus::Ko, output.into())
    }

    /// Synthetic reply for a site that did not answer in time.
    pub fn timeout(site: &str, request_id: &str, resource_id: &str) -> Self {
        Self {
            site: site.to_string(),
            request_id: request_id.to_string(),
            resource_id: resource_id.to_string(),
            status: ReplyStatus::Timeout,
            output: String::new(),
            input: String::new(),
            execution_time: None,
        }
    }

    /// Whether the reply reports success.
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}

/// One site's view of a resource: its participants and local history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceDocument {
    /// Owning site; empty when the document belongs to no particular site.
    pub site: String,
    /// Sites participating in the resource, ordered and without duplicates.
    pub locations: Vec<String>,
    /// Local history, oldest first.
    pub operations: Vec<Operation>,
}

impl ResourceDocument {
    /// Create an empty document. Duplicate locations are dropped, keeping the
    /// first occurrence.
    pub fn new<I, S>(site: impl Into<String>, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for location in locations {
            let location = location.into();
            if !unique.contains(&location) {
                unique.push(location);
            }
        }
        Self {
            site: site.into(),
            locations: unique,
            operations: Vec::new(),
        }
    }

    /// Replace the history.
    pub fn with_operations(mut self, operations: Vec<Operation>) -> Self {
        self.operations = operations;
        self
    }

    /// Append one operation to the history.
    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    /// Whether `site` owns this document.
    pub fn is_owned_by(&self, site: &str) -> bool {
        !self.site.is_empty() && self.site == site
    }

    /// Whether the history contains `request_id`.
    pub fn contains(&self, request_id: &str) -> bool {
        self.operations.iter().any(|op| op.request_id == request_id)
    }
}
