//! Cheops server - one site's replication process.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cheops_raft::Node;
use cheops_server::{ApiServer, Args, RequestHandler, ShellExecutor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cheops_server=info,cheops_raft=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting cheops server");

    let config = Args::parse().into_config()?;
    tracing::info!(
        node_id = config.node.node_id,
        site = config.node.site(),
        state_dir = %config.node.state_dir.display(),
        raft_listen = %config.node.raft_listen_addr,
        api = ?config.api_address,
        peers = config.node.bootstrap_peers.len(),
        "configuration loaded"
    );

    let executor = Arc::new(ShellExecutor::new(&config.shell, &config.work_dir));
    let node = Arc::new(Node::start(config.node.clone(), executor).await?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            return;
        }
        tracing::info!("received shutdown signal");
        let _ = signal_tx.send(());
    });

    let result = match &config.api_address {
        Some(_) => {
            let handler = Arc::new(RequestHandler::new(node.clone()));
            match ApiServer::new(&config, handler) {
                Ok(api) => {
                    tracing::info!("server ready, accepting requests");
                    api.run_until_shutdown(shutdown_rx).await
                }
                Err(e) => Err(e),
            }
        }
        None => {
            tracing::info!("server ready, management endpoint disabled");
            let mut shutdown_rx = shutdown_rx;
            let _ = shutdown_rx.recv().await;
            Ok(())
        }
    };

    node.shutdown().await;
    match result {
        Ok(()) => {
            tracing::info!("server shutdown complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "server error");
            Err(e.into())
        }
    }
}
