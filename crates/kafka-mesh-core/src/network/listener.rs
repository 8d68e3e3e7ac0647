//! TCP listener for accepting Kafka client connections.
//!
//! The listener accepts connections and spawns a task for each one,
//! delegating to the connection handler for request processing. All
//! connections share one dispatch table, one upstream configuration and one
//! metrics registry.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::mesh::DispatchTable;
use crate::metrics::MeshMetrics;
use crate::upstream::UpstreamConfiguration;

use super::connection::ConnectionHandler;

/// How long `serve` waits for open connections to close after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP listener that accepts client connections.
pub struct ProxyListener {
    config: Arc<ProxyConfig>,
    configuration: Arc<dyn UpstreamConfiguration>,
    dispatch_table: Arc<DispatchTable>,
    metrics: Arc<MeshMetrics>,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
    next_connection_id: AtomicU64,
}

impl ProxyListener {
    /// Create a new proxy listener serving the standard handlers.
    #[must_use]
    pub fn new(
        config: ProxyConfig,
        configuration: Arc<dyn UpstreamConfiguration>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self::with_dispatch_table(config, configuration, metrics, DispatchTable::standard())
    }

    /// Create a listener serving a custom set of handlers.
    #[must_use]
    pub fn with_dispatch_table(
        config: ProxyConfig,
        configuration: Arc<dyn UpstreamConfiguration>,
        metrics: Arc<MeshMetrics>,
        dispatch_table: DispatchTable,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            configuration,
            dispatch_table: Arc::new(dispatch_table),
            metrics,
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Get a shutdown handle to signal the listener to stop.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Get the current number of active connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind the configured listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.listen.address).await?;
        info!(
            address = %listener.local_addr()?,
            advertised = %self.config.listen.get_advertised_address(),
            "proxy listening"
        );
        Ok(listener)
    }

    /// Bind and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the listen address fails.
    #[instrument(skip(self), fields(address = %self.config.listen.address))]
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; accept errors are logged and skipped.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let current = self.active_connections.load(Ordering::Relaxed);

                            if current >= self.config.listen.max_connections {
                                warn!(
                                    peer = %addr,
                                    active = current,
                                    max = self.config.listen.max_connections,
                                    "connection rejected: limit reached"
                                );
                                // Socket will be dropped, closing the connection
                                continue;
                            }

                            self.active_connections.fetch_add(1, Ordering::Relaxed);
                            self.metrics.inc_client_connections();
                            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                            debug!(peer = %addr, connection_id, active = current + 1, "accepted connection");

                            if let Err(e) = socket.set_nodelay(true) {
                                debug!(peer = %addr, error = %e, "failed to set TCP_NODELAY");
                            }

                            let handler = ConnectionHandler::new(
                                Arc::clone(&self.configuration),
                                Arc::clone(&self.dispatch_table),
                                Arc::clone(&self.metrics),
                                self.shutdown_tx.subscribe(),
                                connection_id,
                            );
                            let metrics = Arc::clone(&self.metrics);
                            let active_connections = Arc::clone(&self.active_connections);

                            tokio::spawn(async move {
                                if let Err(e) = handler.handle(socket).await {
                                    match &e {
                                        ProxyError::Shutdown => {
                                            debug!(peer = %addr, "connection closed: shutdown");
                                        }
                                        ProxyError::UnsupportedRequest { .. }
                                        | ProxyError::UnknownRequest { .. } => {
                                            info!(peer = %addr, error = %e, "connection closed: rejected request");
                                        }
                                        ProxyError::Connection(io_err)
                                            if io_err.kind() == std::io::ErrorKind::UnexpectedEof =>
                                        {
                                            debug!(peer = %addr, "client disconnected");
                                        }
                                        _ => {
                                            error!(peer = %addr, error = %e, "connection error");
                                        }
                                    }
                                }
                                metrics.dec_client_connections();
                                active_connections.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            let active = self.active_connections.load(Ordering::Relaxed);
            if active == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(active, "connections still open after drain timeout");
                return;
            }
            debug!(active, "waiting for connections to close");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
