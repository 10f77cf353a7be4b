//! Management and submission endpoint using async-nng.
//!
//! A REP socket is served by worker threads, each owning an [`AsyncContext`]
//! and a single-threaded runtime for socket I/O. Requests themselves run on
//! the node's runtime, so groups opened while serving a request live as long
//! as the node does.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_nng::AsyncContext;
use nng::options::Options;
use nng::{Message, Protocol, Socket};
use tokio::runtime::Handle;

use crate::config::ServerConfig;
use crate::error::Error;
use crate::handler::{encode_response, ApiResponse, RequestHandler};

/// Endpoint metrics for monitoring.
#[derive(Debug)]
pub struct ApiMetrics {
    /// Total number of requests received.
    pub requests_total: AtomicU64,
    /// Number of successful requests.
    pub requests_success: AtomicU64,
    /// Number of failed requests.
    pub requests_failed: AtomicU64,
    /// Number of bytes received.
    pub bytes_received: AtomicU64,
    /// Number of bytes sent.
    pub bytes_sent: AtomicU64,
    /// Endpoint start time.
    pub started_at: Instant,
}

impl ApiMetrics {
    fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_success: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    fn record(&self, success: bool, received_bytes: usize, sent_bytes: usize) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_received.fetch_add(received_bytes as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent_bytes as u64, Ordering::Relaxed);
    }

    /// Get the uptime duration.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Get total requests count.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Get successful requests count.
    pub fn successful_requests(&self) -> u64 {
        self.requests_success.load(Ordering::Relaxed)
    }

    /// Get failed requests count.
    pub fn failed_requests(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }
}

impl Default for ApiMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// The endpoint: a listening REP socket and its workers.
pub struct ApiServer {
    socket: Socket,
    address: String,
    handler: Arc<RequestHandler>,
    metrics: Arc<ApiMetrics>,
    max_message_size: usize,
    request_timeout: Duration,
    worker_count: usize,
}

impl ApiServer {
    /// Listen on the configured address.
    pub fn new(config: &ServerConfig, handler: Arc<RequestHandler>) -> Result<Self, Error> {
        let address = config
            .api_address
            .clone()
            .ok_or_else(|| Error::Config("no management endpoint address configured".to_string()))?;

        let socket = Socket::new(Protocol::Rep0)
            .map_err(|e| Error::Transport(format!("failed to create socket: {}", e)))?;
        socket
            .set_opt::<nng::options::RecvMaxSize>(config.max_message_size)
            .map_err(|e| Error::Transport(format!("failed to set max message size: {}", e)))?;
        socket
            .listen(&address)
            .map_err(|e| Error::Transport(format!("failed to listen on {}: {}", address, e)))?;
        tracing::info!(address = %address, "management endpoint listening");

        Ok(Self {
            socket,
            address,
            handler,
            metrics: Arc::new(ApiMetrics::new()),
            max_message_size: config.max_message_size,
            request_timeout: config.request_timeout,
            worker_count: config.api_workers.max(1),
        })
    }

    /// Address the endpoint listens on.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Endpoint metrics.
    pub fn metrics(&self) -> &ApiMetrics {
        &self.metrics
    }

    /// Serve requests until `shutdown` fires.
    ///
    /// Must be called from within the node's runtime.
    pub async fn run_until_shutdown(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let handles = self.spawn_workers(Handle::current(), stop_flag.clone())?;

        let _ = shutdown.recv().await;
        tracing::info!(
            total_requests = self.metrics.total_requests(),
            successful = self.metrics.successful_requests(),
            failed = self.metrics.failed_requests(),
            uptime_secs = self.metrics.uptime().as_secs(),
            "stopping management endpoint"
        );

        stop_flag.store(true, Ordering::SeqCst);
        let _ = tokio::task::spawn_blocking(move || {
            for handle in handles {
                let _ = handle.join();
            }
        })
        .await;
        self.socket.close();
        Ok(())
    }

    fn spawn_workers(
        &self,
        node_runtime: Handle,
        stop_flag: Arc<AtomicBool>,
    ) -> Result<Vec<thread::JoinHandle<()>>, Error> {
        let mut handles = Vec::with_capacity(self.worker_count);
        for worker_id in 0..self.worker_count {
            let worker = ApiWorker {
                worker_id,
                socket: self.socket.clone(),
                handler: self.handler.clone(),
                metrics: self.metrics.clone(),
                node_runtime: node_runtime.clone(),
                max_message_size: self.max_message_size,
                request_timeout: self.request_timeout,
                stop_flag: stop_flag.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("cheops-api-{}", worker_id))
                .spawn(move || worker.run())
                .map_err(|e| Error::Transport(format!("failed to spawn endpoint worker: {}", e)))?;
            handles.push(handle);
        }
        Ok(handles)
    }
}

struct ApiWorker {
    worker_id: usize,
    socket: Socket,
    handler: Arc<RequestHandler>,
    metrics: Arc<ApiMetrics>,
    node_runtime: Handle,
    max_message_size: usize,
    request_timeout: Duration,
    stop_flag: Arc<AtomicBool>,
}

impl ApiWorker {
    fn run(self) {
        let worker_id = self.worker_id;
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(error = %e, worker_id, "failed to build endpoint worker runtime");
                return;
            }
        };

        runtime.block_on(async move {
            let mut ctx = match AsyncContext::try_from(&self.socket) {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::error!(error = %e, worker_id, "failed to create async context");
                    return;
                }
            };

            loop {
                if self.stop_flag.load(Ordering::SeqCst) {
                    tracing::debug!(worker_id, "endpoint worker stopping");
                    return;
                }

                let request = match ctx.receive(Some(Duration::from_secs(1))).await {
                    Ok(msg) => msg,
                    Err(nng::Error::TimedOut) => continue,
                    Err(nng::Error::Closed) => return,
                    Err(e) => {
                        tracing::error!(error = %e, worker_id, "receive error");
                        continue;
                    }
                };

                let received_bytes = request.len();
                let start = Instant::now();
                let (response, is_success) = self.process(request.as_slice().to_vec()).await;
                let elapsed = start.elapsed();

                let sent_bytes = response.len();
                if let Err((_, e)) = ctx.send(Message::from(response.as_slice()), None).await {
                    tracing::error!(error = %e, worker_id, "failed to send response");
                    self.metrics.record(false, received_bytes, 0);
                } else {
                    self.metrics.record(is_success, received_bytes, sent_bytes);
                }

                if elapsed > self.request_timeout {
                    tracing::warn!(
                        worker_id,
                        duration_ms = elapsed.as_millis() as u64,
                        timeout_ms = self.request_timeout.as_millis() as u64,
                        "request exceeded timeout"
                    );
                }
            }
        });
    }

    async fn process(&self, data: Vec<u8>) -> (Vec<u8>, bool) {
        if data.len() > self.max_message_size {
            let response = ApiResponse::error(format!(
                "message too large: {} bytes (max: {})",
                data.len(),
                self.max_message_size
            ));
            return (encode_response(&response), false);
        }

        let handler = self.handler.clone();
        let task = self
            .node_runtime
            .spawn(async move { handler.handle_message(&data).await });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, worker_id = self.worker_id, "request task failed");
                (encode_response(&ApiResponse::error("internal error")), false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_record() {
        let metrics = ApiMetrics::default();
        metrics.record(true, 10, 20);
        metrics.record(false, 5, 0);

        assert_eq!(metrics.total_requests(), 2);
        assert_eq!(metrics.successful_requests(), 1);
        assert_eq!(metrics.failed_requests(), 1);
        assert_eq!(metrics.bytes_received.load(Ordering::Relaxed), 15);
        assert_eq!(metrics.bytes_sent.load(Ordering::Relaxed), 20);
    }
}
