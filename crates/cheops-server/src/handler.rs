//! Request handler for the management and submission endpoint.
//!
//! Requests and responses are JSON documents, one per message.

use std::sync::Arc;

use cheops_core::{Command, Operation, OperationClass, ReplyDocument};
use cheops_raft::{CreateGroup, GroupDump, GroupId, Node, Peer};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A request to the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ApiRequest {
    /// Run `command` on `resource_id` at every one of `sites`.
    #[serde(rename_all = "PascalCase")]
    Submit {
        sites: Vec<String>,
        resource_id: String,
        /// Operation class name, e.g. `commutative` or `idempotent`.
        #[serde(rename = "Type")]
        class: String,
        command: Command,
    },

    /// Declare a group explicitly.
    #[serde(rename_all = "PascalCase")]
    CreateGroup { group_id: GroupId, peers: Vec<Peer> },

    /// Dump one open group, or all of them.
    #[serde(rename_all = "PascalCase")]
    Dump {
        #[serde(default)]
        group_id: Option<GroupId>,
    },

    /// Committed operations on one resource.
    #[serde(rename_all = "PascalCase")]
    History {
        group_id: GroupId,
        resource_id: String,
    },
}

impl ApiRequest {
    /// Request name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Submit { .. } => "submit",
            Self::CreateGroup { .. } => "create_group",
            Self::Dump { .. } => "dump",
            Self::History { .. } => "history",
        }
    }
}

/// A response from the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ApiResponse {
    /// One reply per requested site.
    #[serde(rename_all = "PascalCase")]
    Replies {
        request_id: String,
        group_id: GroupId,
        replies: Vec<ReplyDocument>,
    },

    /// Id of the group serving the declared site set.
    #[serde(rename_all = "PascalCase")]
    GroupCreated { group_id: GroupId },

    /// Group dumps.
    #[serde(rename_all = "PascalCase")]
    Dump { groups: Vec<GroupDump> },

    /// Operations in commit order.
    #[serde(rename_all = "PascalCase")]
    History { operations: Vec<Operation> },

    /// The request failed.
    #[serde(rename_all = "PascalCase")]
    Error { message: String },
}

impl ApiResponse {
    /// Build an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Whether the request succeeded.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Error { .. })
    }
}

/// Decode one request message.
pub fn decode_request(data: &[u8]) -> Result<ApiRequest, Error> {
    serde_json::from_slice(data)
        .map_err(|e| Error::Protocol(format!("failed to decode request: {}", e)))
}

/// Encode one response message.
pub fn encode_response(response: &ApiResponse) -> Vec<u8> {
    match serde_json::to_vec(response) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode response");
            // Error responses only hold a string and always encode.
            serde_json::to_vec(&ApiResponse::error(e.to_string())).unwrap_or_default()
        }
    }
}

/// Handles incoming requests against a running node.
pub struct RequestHandler {
    node: Arc<Node>,
}

impl RequestHandler {
    /// Create a new request handler for `node`.
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// The node requests are served by.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Handle a raw message and return (response bytes, is_success).
    pub async fn handle_message(&self, data: &[u8]) -> (Vec<u8>, bool) {
        let response = match decode_request(data) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                tracing::warn!(error = %e, "malformed request");
                ApiResponse::error(e.to_string())
            }
        };
        let is_ok = response.is_ok();
        (encode_response(&response), is_ok)
    }

    /// Handle a request and return a response.
    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        let kind = request.kind();
        match self.handle_inner(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(request = kind, error = %e, "request failed");
                ApiResponse::error(e.to_string())
            }
        }
    }

    async fn handle_inner(&self, request: ApiRequest) -> Result<ApiResponse, Error> {
        match request {
            ApiRequest::Submit {
                sites,
                resource_id,
                class,
                command,
            } => {
                let class: OperationClass = class.parse()?;
                let stream = self.node.submit(&sites, &resource_id, class, command).await?;
                let request_id = stream.request_id().to_string();
                let group_id = stream.group_id();
                let replies = stream.collect().await;
                Ok(ApiResponse::Replies {
                    request_id,
                    group_id,
                    replies,
                })
            }
            ApiRequest::CreateGroup { group_id, peers } => {
                if peers.is_empty() {
                    return Err(Error::Protocol("a group needs at least one peer".to_string()));
                }
                let group_id = self.node.create_group(CreateGroup::new(group_id, peers)).await?;
                Ok(ApiResponse::GroupCreated { group_id })
            }
            ApiRequest::Dump { group_id } => {
                let groups = match group_id {
                    Some(group_id) => vec![self.node.dump(group_id)?],
                    None => self.node.dump_all(),
                };
                Ok(ApiResponse::Dump { groups })
            }
            ApiRequest::History {
                group_id,
                resource_id,
            } => Ok(ApiResponse::History {
                operations: self.node.history(group_id, &resource_id)?,
            }),
        }
    }
}
