//! In-process cluster of four sites talking over localhost.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cheops_core::{Command, Execution, Executor, Operation, OperationClass, ReplyStatus};
use cheops_raft::{Node, NodeConfig, Peer, RaftConfig, ReplicationError, BOOTSTRAP_GROUP};
use parking_lot::Mutex;

/// Executor that records what it ran.
#[derive(Default)]
struct RecordingExecutor {
    ran: Mutex<Vec<String>>,
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, operation: &Operation, _deadline: Duration) -> Execution {
        self.ran.lock().push(operation.request_id.clone());
        Execution::ok(format!("ran {}", operation.command.script))
    }
}

/// A loopback port the OS just handed out, free again once the listener
/// is dropped.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn peers() -> Vec<Peer> {
    ["site-a", "site-b", "site-c", "site-d"]
        .iter()
        .enumerate()
        .map(|(i, site)| {
            Peer::new(i as u64 + 1, format!("127.0.0.1:{}", free_port())).with_site(*site)
        })
        .collect()
}

async fn start_nodes(
    peers: &[Peer],
    root: &Path,
    reply_timeout_ms: u64,
) -> (Vec<Node>, Vec<Arc<RecordingExecutor>>) {
    let mut nodes = Vec::new();
    let mut executors = Vec::new();
    for id in 1..=peers.len() as u64 {
        let executor = Arc::new(RecordingExecutor::default());
        let config = node_config(id, peers, root).with_reply_timeout_ms(reply_timeout_ms);
        let node = Node::start(config, executor.clone()).await.unwrap();
        nodes.push(node);
        executors.push(executor);
    }
    (nodes, executors)
}

fn node_config(id: u64, peers: &[Peer], root: &Path) -> NodeConfig {
    let addr = peers[id as usize - 1].address.clone();
    NodeConfig::new(id)
        .with_raft_listen_addr(addr)
        .with_state_dir(root.join(format!("node-{}", id)))
        .with_bootstrap_peers(peers.to_vec())
        .with_raft(
            RaftConfig::default()
                .with_heartbeat_interval_ms(50)
                .with_election_timeout_ms(200, 400),
        )
        .with_submit_retries(40, 250)
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_creates_group_and_collects_replies() {
    let dir = tempfile::tempdir().unwrap();
    let peers = peers();
    let (nodes, executors) = start_nodes(&peers, dir.path(), 15_000).await;

    let sites = ["site-a", "site-b", "site-c"];
    let stream = tokio::time::timeout(
        Duration::from_secs(60),
        nodes[0].submit(&sites, "vm-1", OperationClass::Idempotent, Command::shell("echo up")),
    )
    .await
    .unwrap()
    .unwrap();
    let group_id = stream.group_id();
    let request_id = stream.request_id().to_string();
    assert_eq!(group_id, BOOTSTRAP_GROUP + 1);

    let mut replies = stream.collect().await;
    replies.sort_by(|a, b| a.site.cmp(&b.site));
    let got: Vec<_> = replies.iter().map(|r| (r.site.as_str(), r.status)).collect();
    assert_eq!(
        got,
        vec![
            ("site-a", ReplyStatus::Ok),
            ("site-b", ReplyStatus::Ok),
            ("site-c", ReplyStatus::Ok)
        ]
    );
    assert!(replies.iter().all(|r| r.request_id == request_id && r.output == "ran echo up"));

    // Every bootstrap member learns about the new group, members open it.
    for node in &nodes {
        wait_until("catalog entry", || {
            node.registry().catalog().iter().any(|g| g.group_id == group_id)
        })
        .await;
    }
    for node in &nodes[..3] {
        wait_until("replicated replies", || {
            node.dump(group_id)
                .map(|dump| dump.log.len() == 1 && dump.log[0].replies.len() == 3)
                .unwrap_or(false)
        })
        .await;
        let history = node.history(group_id, "vm-1").unwrap();
        assert_eq!(history[0].request_id, request_id);
    }
    assert!(matches!(
        nodes[3].dump(group_id),
        Err(ReplicationError::UnknownGroup(_))
    ));
    assert!(executors[3].ran.lock().is_empty());
    for executor in &executors[..3] {
        assert_eq!(*executor.ran.lock(), vec![request_id.clone()]);
    }

    // The same site set reuses the group, whatever order the sites come in.
    let again = nodes[1]
        .submit(
            &["site-c", "site-a", "site-b"],
            "vm-1",
            OperationClass::Commutative,
            Command::shell("echo again"),
        )
        .await
        .unwrap();
    assert_eq!(again.group_id(), group_id);
    let replies = again.collect().await;
    assert_eq!(replies.len(), 3);
    assert!(replies.iter().all(|r| r.is_ok()));
    assert_eq!(nodes[0].registry().catalog().len(), 1);

    // Too few sites fail before anything is submitted.
    let err = nodes[0]
        .submit(&["site-a", "site-b"], "vm-1", OperationClass::Commutative, Command::shell("true"))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        ReplicationError::InsufficientSites { required: 3, got: 2 }
    ));

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_site_is_reported_as_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let peers = peers();
    let (nodes, executors) = start_nodes(&peers, dir.path(), 5_000).await;

    // site-c goes away; the bootstrap group and the new group keep a quorum.
    nodes[2].shutdown().await;

    let stream = tokio::time::timeout(
        Duration::from_secs(60),
        nodes[0].submit(
            &["site-a", "site-b", "site-c"],
            "vm-2",
            OperationClass::Idempotent,
            Command::shell("echo up"),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    let request_id = stream.request_id().to_string();
    assert_eq!(nodes[0].pending_replies(), 1);

    let mut replies = stream.collect().await;
    replies.sort_by(|a, b| a.site.cmp(&b.site));
    let got: Vec<_> = replies.iter().map(|r| (r.site.as_str(), r.status)).collect();
    assert_eq!(
        got,
        vec![
            ("site-a", ReplyStatus::Ok),
            ("site-b", ReplyStatus::Ok),
            ("site-c", ReplyStatus::Timeout)
        ]
    );
    assert!(replies.iter().all(|r| r.request_id == request_id));
    assert!(replies[2].output.is_empty());

    // The waiter gave its slot back before the stream ended.
    assert_eq!(nodes[0].pending_replies(), 0);
    assert!(executors[2].ran.lock().is_empty());

    for node in [&nodes[0], &nodes[1], &nodes[3]] {
        node.shutdown().await;
    }
}
