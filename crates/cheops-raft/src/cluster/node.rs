//! The per-site orchestrator tying groups, dispatch and replies together.

use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use cheops_core::{new_request_id, Command, Executor, Operation, OperationClass, ReplyDocument};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cluster::bus::ReplyBus;
use crate::cluster::dispatch::{channel_hook, Dispatcher};
use crate::cluster::registry::GroupRegistry;
use crate::config::NodeConfig;
use crate::error::ReplicationError;
use crate::network::server::{GroupTable, RaftTransport};
use crate::types::{CreateGroup, GroupDump, GroupEntry, GroupId};

/// Fewest distinct sites a replication group may span.
pub const MIN_SITES: usize = 3;

/// Deduplicate `sites` and check there are enough of them.
pub fn validate_sites<S: AsRef<str>>(sites: &[S]) -> Result<BTreeSet<String>, ReplicationError> {
    let unique: BTreeSet<String> = sites
        .iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if unique.len() < MIN_SITES {
        return Err(ReplicationError::InsufficientSites {
            required: MIN_SITES,
            got: unique.len(),
        });
    }
    Ok(unique)
}

/// Replies to one submitted operation, one per expected site.
///
/// Sites that did not answer within the reply timeout are reported with a
/// `TIMEOUT` status. Dropping the stream stops the wait; the operation stays
/// committed.
pub struct ReplyStream {
    request_id: String,
    group_id: GroupId,
    replies: mpsc::Receiver<ReplyDocument>,
}

impl ReplyStream {
    /// Request id of the submitted operation.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Group the operation was submitted to.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Next reply, or `None` once every site is accounted for.
    pub async fn next_reply(&mut self) -> Option<ReplyDocument> {
        self.replies.recv().await
    }

    /// Wait for all replies.
    pub async fn collect(mut self) -> Vec<ReplyDocument> {
        let mut all = Vec::new();
        while let Some(reply) = self.replies.recv().await {
            all.push(reply);
        }
        all
    }
}

impl Stream for ReplyStream {
    type Item = ReplyDocument;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.replies.poll_recv(cx)
    }
}

/// A running site: its transport, its groups and the reply plumbing.
pub struct Node {
    config: Arc<NodeConfig>,
    registry: Arc<GroupRegistry>,
    bus: Arc<ReplyBus>,
    transport: Mutex<Option<RaftTransport>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Start a node: listen for group traffic, open the bootstrap group and
    /// reopen every cataloged group this node belongs to.
    pub async fn start(
        config: NodeConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, ReplicationError> {
        config.validate()?;
        std::fs::create_dir_all(&config.state_dir).map_err(|e| {
            ReplicationError::Initialization(format!(
                "Failed to create state dir {}: {}",
                config.state_dir.display(),
                e
            ))
        })?;
        let config = Arc::new(config);

        let table = Arc::new(GroupTable::new());
        let transport = RaftTransport::start(
            config.node_id,
            config.raft_listen_addr.clone(),
            table.clone(),
            config.transport_workers,
        )?;

        let (applied_tx, applied_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(GroupRegistry::new(
            config.clone(),
            table,
            channel_hook(applied_tx),
        ));
        let bus = Arc::new(ReplyBus::new());

        let dispatcher = Dispatcher::new(config.site(), registry.clone(), bus.clone(), executor)
            .with_exec_deadline(config.exec_deadline())
            .with_open_timeout(config.apply_timeout());
        let mut tasks = vec![tokio::spawn(dispatcher.run(applied_rx))];

        registry.open(&registry.bootstrap_group()).await?;
        for group in registry.catalog() {
            if !group.includes(config.node_id) {
                continue;
            }
            if let Err(e) = registry.open(&group).await {
                tracing::error!(group_id = group.group_id, error = %e, "failed to reopen group");
            }
        }

        let sweeper_bus = bus.clone();
        let ttl = config.bus_ttl();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl.max(Duration::from_secs(1)));
            loop {
                interval.tick().await;
                let dropped = sweeper_bus.sweep(ttl);
                if dropped > 0 {
                    tracing::debug!(dropped, "swept reply bus");
                }
            }
        }));

        tracing::info!(
            node_id = config.node_id,
            site = config.site(),
            address = %config.raft_listen_addr,
            "node started"
        );

        Ok(Self {
            config,
            registry,
            bus,
            transport: Mutex::new(Some(transport)),
            tasks: Mutex::new(tasks),
        })
    }

    /// Node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Site this node serves.
    pub fn site(&self) -> &str {
        self.config.site()
    }

    /// The group registry.
    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    /// Requests still waiting for replies.
    pub fn pending_replies(&self) -> usize {
        self.bus.len()
    }

    /// Submit an operation on `resource_id` to be run on every one of `sites`.
    ///
    /// Fails fast when fewer than [`MIN_SITES`] distinct sites are named.
    pub async fn submit<S: AsRef<str>>(
        &self,
        sites: &[S],
        resource_id: &str,
        class: OperationClass,
        command: Command,
    ) -> Result<ReplyStream, ReplicationError> {
        let sites = validate_sites(sites)?;
        let group = self.registry.resolve(&sites).await?;
        let group_id = group.group_id();

        let operation = Operation::new(new_request_id(), class, self.site(), resource_id, command);
        let request_id = operation.request_id.clone();

        let inbox = self.bus.subscribe(group_id, &request_id).ok_or_else(|| {
            ReplicationError::Internal(format!("request {} already has a waiter", request_id))
        })?;

        tracing::info!(
            group_id,
            request_id = %request_id,
            resource_id,
            class = %class,
            sites = sites.len(),
            "submitting operation"
        );
        if let Err(e) = group.submit(GroupEntry::OperationSubmitted(operation.clone())).await {
            self.bus.release(group_id, &request_id);
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(sites.len());
        let waiter = ReplyWaiter {
            group_id,
            request_id: request_id.clone(),
            resource_id: operation.resource_id,
            sites,
            timeout: self.config.reply_timeout(),
            bus: self.bus.clone(),
        };
        tokio::spawn(waiter.run(inbox, tx));

        Ok(ReplyStream {
            request_id,
            group_id,
            replies: rx,
        })
    }

    /// Submit and wait for every site's reply.
    pub async fn execute<S: AsRef<str>>(
        &self,
        sites: &[S],
        resource_id: &str,
        class: OperationClass,
        command: Command,
    ) -> Result<Vec<ReplyDocument>, ReplicationError> {
        Ok(self
            .submit(sites, resource_id, class, command)
            .await?
            .collect()
            .await)
    }

    /// Declare a group explicitly and open it when this node is a member.
    pub async fn create_group(&self, create: CreateGroup) -> Result<GroupId, ReplicationError> {
        let group_id = self.registry.create(create.clone()).await?;
        if group_id == create.group_id && create.includes(self.config.node_id) {
            self.registry.open(&create).await?;
        }
        Ok(group_id)
    }

    /// Management view of one open group.
    pub fn dump(&self, group_id: GroupId) -> Result<GroupDump, ReplicationError> {
        self.registry
            .get(group_id)
            .map(|g| g.dump())
            .ok_or(ReplicationError::UnknownGroup(group_id))
    }

    /// Management view of every open group.
    pub fn dump_all(&self) -> Vec<GroupDump> {
        self.registry.open_groups().iter().map(|g| g.dump()).collect()
    }

    /// Committed operations on `resource_id` in `group_id`.
    pub fn history(&self, group_id: GroupId, resource_id: &str) -> Result<Vec<Operation>, ReplicationError> {
        self.registry
            .get(group_id)
            .map(|g| g.ledger().history(resource_id))
            .ok_or(ReplicationError::UnknownGroup(group_id))
    }

    /// Stop background tasks, groups and the transport.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.registry.shutdown().await;
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.shutdown().await;
        }
        tracing::info!(node_id = self.config.node_id, "node stopped");
    }
}

/// Collects the replies of one request from the bus.
struct ReplyWaiter {
    group_id: GroupId,
    request_id: String,
    resource_id: String,
    sites: BTreeSet<String>,
    timeout: Duration,
    bus: Arc<ReplyBus>,
}

impl ReplyWaiter {
    async fn run(
        self,
        mut inbox: mpsc::UnboundedReceiver<ReplyDocument>,
        out: mpsc::Sender<ReplyDocument>,
    ) {
        let mut answered: HashMap<String, bool> =
            self.sites.iter().map(|s| (s.clone(), false)).collect();
        let mut remaining = self.sites.len();
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        while remaining > 0 {
            tokio::select! {
                reply = inbox.recv() => {
                    let Some(reply) = reply else { break };
                    match answered.get_mut(&reply.site) {
                        Some(seen) if !*seen => {
                            *seen = true;
                            remaining -= 1;
                            if out.send(reply).await.is_err() {
                                break;
                            }
                        }
                        _ => tracing::trace!(site = %reply.site, "ignoring reply"),
                    }
                }
                _ = &mut deadline => {
                    tracing::warn!(
                        group_id = self.group_id,
                        request_id = %self.request_id,
                        missing = remaining,
                        "reply timeout"
                    );
                    break;
                }
                _ = out.closed() => {
                    tracing::debug!(request_id = %self.request_id, "caller stopped waiting");
                    break;
                }
            }
        }

        if !out.is_closed() {
            for (site, seen) in &answered {
                if !*seen {
                    let reply = ReplyDocument::timeout(site, &self.request_id, &self.resource_id);
                    if out.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.bus.release(self.group_id, &self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cheops_core::ReplyStatus;

    #[test]
    fn test_validate_sites() {
        let err = validate_sites(&["a", "b"]).unwrap_err();
        assert!(matches!(err, ReplicationError::InsufficientSites { required: 3, got: 2 }));
        assert_eq!(err.to_string(), "At least 3 distinct sites are required, got 2");

        assert!(validate_sites(&["a", "a", "b", " "]).is_err());
        let sites = validate_sites(&["c", "a", "b", "a"]).unwrap();
        assert_eq!(sites.into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    fn waiter(bus: Arc<ReplyBus>, timeout: Duration) -> ReplyWaiter {
        ReplyWaiter {
            group_id: 1,
            request_id: "r1".to_string(),
            resource_id: "vm".to_string(),
            sites: ["a", "b", "c"].iter().map(|s| s.to_string()).collect(),
            timeout,
            bus,
        }
    }

    fn ok(site: &str) -> ReplyDocument {
        let mut reply = ReplyDocument::timeout(site, "r1", "vm");
        reply.status = ReplyStatus::Ok;
        reply
    }

    #[tokio::test]
    async fn test_waiter_fills_missing_sites_with_timeouts() {
        let bus = Arc::new(ReplyBus::new());
        let inbox = bus.subscribe(1, "r1").unwrap();
        bus.deliver(1, ok("b"));
        bus.deliver(1, ok("b"));
        bus.deliver(1, ok("zz"));

        let (tx, rx) = mpsc::channel(3);
        tokio::spawn(waiter(bus.clone(), Duration::from_millis(100)).run(inbox, tx));

        let stream = ReplyStream {
            request_id: "r1".to_string(),
            group_id: 1,
            replies: rx,
        };
        let replies = stream.collect().await;
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0].site, "b");
        assert_eq!(replies[0].status, ReplyStatus::Ok);
        let mut timed_out: Vec<_> = replies[1..]
            .iter()
            .filter(|r| r.status == ReplyStatus::Timeout)
            .map(|r| r.site.as_str())
            .collect();
        timed_out.sort();
        assert_eq!(timed_out, vec!["a", "c"]);
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_finishes_when_all_replied() {
        let bus = Arc::new(ReplyBus::new());
        let inbox = bus.subscribe(1, "r1").unwrap();
        for site in ["c", "a", "b"] {
            bus.deliver(1, ok(site));
        }

        let (tx, rx) = mpsc::channel(3);
        let handle = tokio::spawn(waiter(bus.clone(), Duration::from_secs(30)).run(inbox, tx));
        let replies = ReplyStream {
            request_id: "r1".to_string(),
            group_id: 1,
            replies: rx,
        }
        .collect()
        .await;

        handle.await.unwrap();
        assert!(replies.iter().all(|r| r.status == ReplyStatus::Ok));
        assert_eq!(replies.len(), 3);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_slot() {
        let bus = Arc::new(ReplyBus::new());
        let inbox = bus.subscribe(1, "r1").unwrap();
        let (tx, rx) = mpsc::channel(3);
        let handle = tokio::spawn(waiter(bus.clone(), Duration::from_secs(30)).run(inbox, tx));

        drop(rx);
        handle.await.unwrap();
        assert!(bus.is_empty());
    }
}
