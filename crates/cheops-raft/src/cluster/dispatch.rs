//! Reaction to entries applied by the local state machines.
//!
//! The apply hook of every group only pushes `(GroupId, GroupEntry)` onto a
//! channel. The [`Dispatcher`] drains it:
//! - submitted operations go to a sequential worker per group, which decides
//!   what this site must run and records the replies. What is pending is
//!   always recomputed from the group's ledger, so an operation whose reply
//!   could not be recorded runs again on the next pass over its resource
//! - recorded replies are handed to the [`ReplyBus`]
//! - created groups are opened when this node is a member

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cheops_core::{Executor, Operation, ReplyDocument};
use tokio::sync::mpsc;

use crate::cluster::bus::ReplyBus;
use crate::cluster::group::ReplicationGroup;
use crate::cluster::registry::GroupRegistry;
use crate::error::ReplicationError;
use crate::storage::state_machine::ApplyHook;
use crate::types::{CreateGroup, GroupEntry, GroupId};

/// Sending side of the applied-entry channel.
pub type AppliedSender = mpsc::UnboundedSender<(GroupId, GroupEntry)>;

/// Receiving side of the applied-entry channel.
pub type AppliedReceiver = mpsc::UnboundedReceiver<(GroupId, GroupEntry)>;

/// Build an apply hook that forwards every recorded entry to `sender`.
pub fn channel_hook(sender: AppliedSender) -> ApplyHook {
    Arc::new(move |group_id, entry| {
        if sender.send((group_id, entry.clone())).is_err() {
            tracing::warn!(group_id, kind = entry.kind(), "dispatcher gone, entry not dispatched");
        }
    })
}

/// Routes applied entries to their local consumers.
pub struct Dispatcher {
    site: String,
    registry: Arc<GroupRegistry>,
    bus: Arc<ReplyBus>,
    executor: Arc<dyn Executor>,
    exec_deadline: Duration,
    open_timeout: Duration,
    workers: HashMap<GroupId, mpsc::UnboundedSender<Operation>>,
}

impl Dispatcher {
    /// Create a dispatcher executing operations as `site`.
    pub fn new(
        site: impl Into<String>,
        registry: Arc<GroupRegistry>,
        bus: Arc<ReplyBus>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            site: site.into(),
            registry,
            bus,
            executor,
            exec_deadline: Duration::from_secs(3),
            open_timeout: Duration::from_secs(10),
            workers: HashMap::new(),
        }
    }

    /// Set the deadline of one local execution.
    pub fn with_exec_deadline(mut self, deadline: Duration) -> Self {
        self.exec_deadline = deadline;
        self
    }

    /// Set how long a worker waits for its group to be opened.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Drain `events` until every sender is gone.
    pub async fn run(mut self, mut events: AppliedReceiver) {
        while let Some((group_id, entry)) = events.recv().await {
            match entry {
                GroupEntry::OperationSubmitted(operation) => self.enqueue(group_id, operation),
                GroupEntry::ReplyRecorded(reply) => {
                    tracing::debug!(
                        group_id,
                        request_id = %reply.request_id,
                        site = %reply.site,
                        status = %reply.status,
                        "reply recorded"
                    );
                    self.bus.deliver(group_id, reply);
                }
                GroupEntry::GroupCreated(create) => self.on_group_created(create),
            }
        }
        tracing::debug!("dispatcher stopped");
    }

    fn enqueue(&mut self, group_id: GroupId, operation: Operation) {
        let operation = match self.worker(group_id).send(operation) {
            Ok(()) => return,
            Err(mpsc::error::SendError(operation)) => operation,
        };
        // The previous worker died; start over with a fresh one.
        self.workers.remove(&group_id);
        if self.worker(group_id).send(operation).is_err() {
            tracing::error!(group_id, "operation worker unavailable");
        }
    }

    fn worker(&mut self, group_id: GroupId) -> &mpsc::UnboundedSender<Operation> {
        self.workers.entry(group_id).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = OperationWorker {
                group_id,
                site: self.site.clone(),
                registry: self.registry.clone(),
                executor: self.executor.clone(),
                exec_deadline: self.exec_deadline,
                open_timeout: self.open_timeout,
            };
            tokio::spawn(worker.run(rx));
            tx
        })
    }

    fn on_group_created(&self, create: CreateGroup) {
        if !create.includes(self.registry.node_id()) {
            tracing::info!(group_id = create.group_id, "group recorded, not a member");
            return;
        }
        let registry = self.registry.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.open(&create).await {
                tracing::error!(group_id = create.group_id, error = %e, "failed to open group");
            }
        });
    }
}

/// The part of an open group an [`OperationWorker`] works against.
#[async_trait]
trait PendingWork: Send + Sync {
    /// Operations `site` still has to run for `resource_id`.
    fn operations_to_run(&self, site: &str, resource_id: &str) -> Vec<Operation>;

    /// Commit a reply and wait until it is applied locally.
    async fn record_reply(&self, reply: ReplyDocument) -> Result<(), ReplicationError>;
}

#[async_trait]
impl PendingWork for ReplicationGroup {
    fn operations_to_run(&self, site: &str, resource_id: &str) -> Vec<Operation> {
        ReplicationGroup::operations_to_run(self, site, resource_id)
    }

    async fn record_reply(&self, reply: ReplyDocument) -> Result<(), ReplicationError> {
        self.submit(GroupEntry::ReplyRecorded(reply)).await.map(|_| ())
    }
}

/// Runs the committed operations of one group, one at a time.
struct OperationWorker {
    group_id: GroupId,
    site: String,
    registry: Arc<GroupRegistry>,
    executor: Arc<dyn Executor>,
    exec_deadline: Duration,
    open_timeout: Duration,
}

impl OperationWorker {
    async fn run(self, mut operations: mpsc::UnboundedReceiver<Operation>) {
        while let Some(operation) = operations.recv().await {
            self.handle(operation).await;
        }
    }

    async fn handle(&self, operation: Operation) {
        let group_id = self.group_id;
        let Some(group) = self.registry.wait_open(group_id, self.open_timeout).await else {
            tracing::warn!(
                group_id,
                request_id = %operation.request_id,
                "group not open, operation left for a later catch-up"
            );
            return;
        };

        self.run_pending(&*group, &operation.resource_id).await;
    }

    /// Run whatever is pending on `resource_id` and record each reply.
    ///
    /// Stops at the first reply that cannot be recorded; the operations left
    /// are still pending in the ledger and are picked up by the next pass.
    /// Returns the number of replies recorded.
    async fn run_pending(&self, group: &dyn PendingWork, resource_id: &str) -> usize {
        let group_id = self.group_id;
        let mut recorded = 0;
        for op in group.operations_to_run(&self.site, resource_id) {
            tracing::info!(
                group_id,
                request_id = %op.request_id,
                resource_id = %op.resource_id,
                class = %op.class,
                "executing operation"
            );
            let execution = self.executor.execute(&op, self.exec_deadline).await;
            let reply = execution.into_reply(&self.site, &op);

            if let Err(e) = group.record_reply(reply).await {
                tracing::error!(
                    group_id,
                    request_id = %op.request_id,
                    error = %e,
                    "failed to record reply, operation stays pending"
                );
                break;
            }
            recorded += 1;
        }
        recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::network::server::GroupTable;
    use crate::types::Peer;
    use cheops_core::{
        compute_operations_to_run, Command, Execution, OperationClass, ResourceDocument,
    };
    use parking_lot::Mutex;

    struct NeverCalled;

    #[async_trait::async_trait]
    impl Executor for NeverCalled {
        async fn execute(&self, _operation: &Operation, _deadline: Duration) -> Execution {
            panic!("no operation should run");
        }
    }

    /// Executor that records what it ran.
    #[derive(Default)]
    struct Recording {
        ran: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Executor for Recording {
        async fn execute(&self, operation: &Operation, _deadline: Duration) -> Execution {
            self.ran.lock().push(operation.request_id.clone());
            Execution::ok("done")
        }
    }

    /// In-memory group whose first `failures` reply commits fail.
    struct FlakyGroup {
        history: Mutex<Vec<Operation>>,
        replies: Mutex<Vec<ReplyDocument>>,
        failures: Mutex<usize>,
    }

    impl FlakyGroup {
        fn new(failures: usize) -> Self {
            Self {
                history: Mutex::new(Vec::new()),
                replies: Mutex::new(Vec::new()),
                failures: Mutex::new(failures),
            }
        }

        fn commit(&self, request_id: &str) {
            self.history.lock().push(Operation::new(
                request_id,
                OperationClass::Commutative,
                "other",
                "vm",
                Command::shell("true"),
            ));
        }

        fn replied(&self) -> Vec<String> {
            self.replies.lock().iter().map(|r| r.request_id.clone()).collect()
        }
    }

    #[async_trait]
    impl PendingWork for FlakyGroup {
        fn operations_to_run(&self, site: &str, resource_id: &str) -> Vec<Operation> {
            let operations: Vec<Operation> = self
                .history
                .lock()
                .iter()
                .filter(|op| op.resource_id == resource_id)
                .cloned()
                .collect();
            let document = ResourceDocument::new("", [site]).with_operations(operations);
            compute_operations_to_run(site, &[document], &self.replies.lock())
        }

        async fn record_reply(&self, reply: ReplyDocument) -> Result<(), ReplicationError> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ReplicationError::NoLeader(1));
            }
            self.replies.lock().push(reply);
            Ok(())
        }
    }

    fn registry() -> Arc<GroupRegistry> {
        let config = NodeConfig::new(1).with_bootstrap_peers(vec![Peer::new(1, "127.0.0.1:1")]);
        Arc::new(GroupRegistry::new(
            Arc::new(config),
            Arc::new(GroupTable::new()),
            Arc::new(|_, _| {}),
        ))
    }

    fn dispatcher(bus: Arc<ReplyBus>) -> Dispatcher {
        Dispatcher::new("127.0.0.1", registry(), bus, Arc::new(NeverCalled))
            .with_open_timeout(Duration::from_millis(20))
    }

    fn worker(executor: Arc<dyn Executor>) -> OperationWorker {
        OperationWorker {
            group_id: 1,
            site: "site-a".to_string(),
            registry: registry(),
            executor,
            exec_deadline: Duration::from_secs(1),
            open_timeout: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_replies_reach_the_bus() {
        let bus = Arc::new(ReplyBus::new());
        let mut rx = bus.subscribe(4, "r1").unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        let hook = channel_hook(tx);

        let op = Operation::new("r1", OperationClass::Idempotent, "a", "vm", Command::shell("true"));
        hook(4, &GroupEntry::ReplyRecorded(ReplyDocument::ok("b", &op, "done")));
        drop(hook);

        dispatcher(bus.clone()).run(events).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.site, "b");
        assert_eq!(reply.output, "done");
    }

    #[tokio::test]
    async fn test_operation_for_unopened_group_is_skipped() {
        let bus = Arc::new(ReplyBus::new());
        let (tx, events) = mpsc::unbounded_channel();
        let op = Operation::new("r1", OperationClass::Commutative, "a", "vm", Command::shell("true"));
        tx.send((7, GroupEntry::OperationSubmitted(op))).unwrap();
        drop(tx);

        dispatcher(bus.clone()).run(events).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_unrecorded_reply_runs_again_on_next_commit() {
        let executor = Arc::new(Recording::default());
        let worker = worker(executor.clone());
        let group = FlakyGroup::new(1);

        group.commit("r1");
        assert_eq!(worker.run_pending(&group, "vm").await, 0);
        assert!(group.replied().is_empty());

        group.commit("r2");
        assert_eq!(worker.run_pending(&group, "vm").await, 2);
        assert_eq!(group.replied(), vec!["r1", "r2"]);
        assert_eq!(*executor.ran.lock(), vec!["r1", "r1", "r2"]);

        // Nothing left once every reply is on record.
        assert_eq!(worker.run_pending(&group, "vm").await, 0);
        assert_eq!(executor.ran.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_reply_stops_the_pass() {
        let executor = Arc::new(Recording::default());
        let worker = worker(executor.clone());
        let group = FlakyGroup::new(1);
        group.commit("r1");
        group.commit("r2");

        assert_eq!(worker.run_pending(&group, "vm").await, 0);
        assert_eq!(*executor.ran.lock(), vec!["r1"]);

        assert_eq!(worker.run_pending(&group, "vm").await, 2);
        assert_eq!(group.replied(), vec!["r1", "r2"]);
    }
}
