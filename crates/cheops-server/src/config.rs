//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use cheops_raft::{NodeConfig, NodeId, Peer, RaftConfig};
use clap::Parser;

use crate::error::Error;

/// Default address of the management endpoint.
pub const DEFAULT_API_ADDRESS: &str = "tcp://0.0.0.0:7200";

/// Default shell used to run commands.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Default maximum message size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

fn default_api_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
        .max(1)
}

/// Parse a `ID=[SITE@]HOST:PORT` peer declaration.
pub fn parse_peer(value: &str) -> Result<Peer, String> {
    let (id, rest) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=[SITE@]HOST:PORT, got '{}'", value))?;
    let id: NodeId = id
        .trim()
        .parse()
        .map_err(|_| format!("invalid peer id '{}'", id))?;

    let (site, address) = match rest.split_once('@') {
        Some((site, address)) => (Some(site.trim()), address.trim()),
        None => (None, rest.trim()),
    };
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
        _ => return Err(format!("invalid peer address '{}'", address)),
    }

    let peer = Peer::new(id, address);
    Ok(match site {
        Some("") => return Err(format!("empty site name in '{}'", value)),
        Some(site) => peer.with_site(site),
        None => peer,
    })
}

/// Cheops server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Replication node configuration.
    pub node: NodeConfig,

    /// Address of the management endpoint. None disables it.
    pub api_address: Option<String>,

    /// Number of management endpoint worker loops.
    pub api_workers: usize,

    /// Shell running command scripts.
    pub shell: PathBuf,

    /// Directory holding one working directory per executed request.
    pub work_dir: PathBuf,

    /// Maximum message size in bytes.
    pub max_message_size: usize,

    /// Requests slower than this are logged.
    pub request_timeout: Duration,
}

impl ServerConfig {
    /// Create a configuration around `node`.
    pub fn new(node: NodeConfig) -> Self {
        let work_dir = node.state_dir.join("work");
        Self {
            node,
            api_address: Some(DEFAULT_API_ADDRESS.to_string()),
            api_workers: default_api_workers(),
            shell: PathBuf::from(DEFAULT_SHELL),
            work_dir,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Set the management endpoint address.
    pub fn with_api_address(mut self, address: impl Into<String>) -> Self {
        self.api_address = Some(address.into());
        self
    }

    /// Disable the management endpoint.
    pub fn without_api(mut self) -> Self {
        self.api_address = None;
        self
    }

    /// Set the number of management endpoint worker loops.
    pub fn with_api_workers(mut self, workers: usize) -> Self {
        self.api_workers = workers.max(1);
        self
    }

    /// Set the shell.
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Set the working directory root.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Set the maximum message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(NodeConfig::default())
    }
}

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "cheops-server")]
#[command(version, about = "Cheops site replication server", long_about = None)]
pub struct Args {
    /// Id of this node among the peers.
    #[arg(long, default_value_t = 1)]
    pub node_id: NodeId,

    /// Bootstrap group member, as ID=[SITE@]HOST:PORT. Repeat for every site.
    #[arg(long = "peer", value_parser = parse_peer, required = true)]
    pub peers: Vec<Peer>,

    /// Address the group transport listens on. Defaults to this node's peer address.
    #[arg(long)]
    pub raft_listen: Option<String>,

    /// Directory holding the state of every group.
    #[arg(long, default_value = "./cheops-state")]
    pub state_dir: PathBuf,

    /// Management endpoint address. Set to "none" to disable it.
    #[arg(long, default_value = DEFAULT_API_ADDRESS)]
    pub api: String,

    /// Milliseconds a submitter waits for replies before missing sites time out.
    #[arg(long, default_value_t = 20_000)]
    pub reply_timeout: u64,

    /// Milliseconds one local command may run.
    #[arg(long, default_value_t = 3_000)]
    pub exec_deadline: u64,

    /// Worker loops per endpoint (0 = auto).
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Shell running command scripts.
    #[arg(long, default_value = DEFAULT_SHELL)]
    pub shell: PathBuf,

    /// Root of the per-request working directories. Defaults to STATE_DIR/work.
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 150)]
    pub heartbeat_ms: u64,

    /// Minimum election timeout in milliseconds.
    #[arg(long, default_value_t = 300)]
    pub election_min_ms: u64,

    /// Maximum election timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub election_max_ms: u64,

    /// Log entries between snapshots.
    #[arg(long, default_value_t = 10_000)]
    pub snapshot_threshold: u64,

    /// Submit attempts while a group has no leader.
    #[arg(long, default_value_t = 10)]
    pub submit_retries: u32,

    /// Milliseconds between submit attempts.
    #[arg(long, default_value_t = 1_000)]
    pub submit_backoff: u64,
}

impl Args {
    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> Result<ServerConfig, Error> {
        let raft_listen = match self.raft_listen {
            Some(addr) => addr,
            None => self
                .peers
                .iter()
                .find(|p| p.id == self.node_id)
                .map(|p| p.address.clone())
                .ok_or_else(|| {
                    Error::Config(format!(
                        "node {} is not among the peers and no --raft-listen was given",
                        self.node_id
                    ))
                })?,
        };

        let raft = RaftConfig::default()
            .with_heartbeat_interval_ms(self.heartbeat_ms)
            .with_election_timeout_ms(self.election_min_ms, self.election_max_ms)
            .with_snapshot_threshold(self.snapshot_threshold);

        let workers = if self.workers == 0 {
            default_api_workers()
        } else {
            self.workers
        };

        let mut node = NodeConfig::new(self.node_id)
            .with_raft_listen_addr(raft_listen)
            .with_state_dir(self.state_dir)
            .with_bootstrap_peers(self.peers)
            .with_raft(raft)
            .with_reply_timeout_ms(self.reply_timeout)
            .with_exec_deadline_ms(self.exec_deadline)
            .with_submit_retries(self.submit_retries, self.submit_backoff);
        node.transport_workers = workers;
        node.validate()?;

        let mut config = ServerConfig::new(node)
            .with_api_workers(workers)
            .with_shell(self.shell);
        if let Some(work_dir) = self.work_dir {
            config = config.with_work_dir(work_dir);
        }
        if self.api.eq_ignore_ascii_case("none") {
            config = config.without_api();
        } else {
            config = config.with_api_address(self.api);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "cheops-server",
            "--peer",
            "1=paris@10.0.0.1:7100",
            "--peer",
            "2=10.0.0.2:7100",
            "--peer",
            "3=nantes@10.0.0.3:7100",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_peer() {
        let peer = parse_peer("3=rennes@192.168.1.3:7100").unwrap();
        assert_eq!(peer.id, 3);
        assert_eq!(peer.address, "192.168.1.3:7100");
        assert_eq!(peer.site(), "rennes");

        let peer = parse_peer("4=192.168.1.4:7100").unwrap();
        assert_eq!(peer.site(), "192.168.1.4");
    }

    #[test]
    fn test_parse_peer_rejects_garbage() {
        assert!(parse_peer("192.168.1.4:7100").is_err());
        assert!(parse_peer("x=192.168.1.4:7100").is_err());
        assert!(parse_peer("1=192.168.1.4").is_err());
        assert!(parse_peer("1=192.168.1.4:port").is_err());
        assert!(parse_peer("1=@192.168.1.4:7100").is_err());
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.api_address, Some(DEFAULT_API_ADDRESS.to_string()));
        assert_eq!(config.shell, PathBuf::from(DEFAULT_SHELL));
        assert_eq!(config.work_dir, PathBuf::from("./cheops-state").join("work"));
        assert!(config.api_workers >= 1);
    }

    #[test]
    fn test_args_into_config() {
        let config = args(&["--node-id", "2", "--reply-timeout", "5000", "--workers", "3"])
            .into_config()
            .unwrap();
        assert_eq!(config.node.node_id, 2);
        assert_eq!(config.node.raft_listen_addr, "10.0.0.2:7100");
        assert_eq!(config.node.site(), "10.0.0.2");
        assert_eq!(config.node.reply_timeout(), Duration::from_secs(5));
        assert_eq!(config.node.bootstrap_peers.len(), 3);
        assert_eq!(config.node.transport_workers, 3);
        assert_eq!(config.api_workers, 3);
    }

    #[test]
    fn test_args_disable_api() {
        let config = args(&["--api", "none", "--work-dir", "/tmp/cheops"])
            .into_config()
            .unwrap();
        assert!(config.api_address.is_none());
        assert_eq!(config.work_dir, PathBuf::from("/tmp/cheops"));
        assert_eq!(config.node.site(), "paris");
    }

    #[test]
    fn test_args_unknown_node() {
        let err = args(&["--node-id", "9"]).into_config().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_args_empty_election_range() {
        let err = args(&["--election-min-ms", "500", "--election-max-ms", "500"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, Error::Replication(_)));
    }
}
