//! Test harness for integration testing of the mesh proxy.
//!
//! Starts a real [`ProxyListener`] on an ephemeral local port, backed by a
//! [`TopicRouter`] built from test configuration.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{
    ClusterConfig, ForwardingRule, ListenConfig, ProxyConfig, UpstreamConfig,
};
use crate::error::Result;
use crate::metrics::MeshMetrics;
use crate::network::ProxyListener;
use crate::upstream::{TopicRouter, UpstreamConfiguration};

use super::client::TestClient;

/// Address advertised by harness proxies.
pub const TEST_ADVERTISED_ADDRESS: &str = "mesh.test:19092";

/// A running proxy for integration tests.
pub struct MeshTestHarness {
    address: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<Result<()>>>,
    /// Metrics of the running proxy.
    pub metrics: Arc<MeshMetrics>,
    /// Router the proxy resolves topics with.
    pub router: Arc<TopicRouter>,
    /// Configuration the proxy was started with.
    pub config: ProxyConfig,
}

impl MeshTestHarness {
    /// Start a proxy with the default test topology.
    ///
    /// Default topology: cluster `apples` (5 partitions) serving topics
    /// prefixed `apples`, cluster `bananas` (3 partitions) serving topics
    /// matching `banana-.*`.
    ///
    /// # Panics
    ///
    /// Panics if the proxy cannot be started.
    pub async fn start() -> Self {
        TestHarnessBuilder::new().build().await
    }

    /// Start a proxy with `config`. The listen address is replaced with an
    /// ephemeral local port.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid or binding fails.
    pub async fn with_config(mut config: ProxyConfig) -> Self {
        config.listen.address = "127.0.0.1:0".to_string();

        let router =
            Arc::new(TopicRouter::from_config(&config).expect("test config should be valid"));
        let configuration: Arc<dyn UpstreamConfiguration> = router.clone();
        let metrics = Arc::new(MeshMetrics::new());
        let listener = Arc::new(ProxyListener::new(
            config.clone(),
            configuration,
            Arc::clone(&metrics),
        ));

        let socket = listener.bind().await.expect("failed to bind test proxy");
        let address = socket.local_addr().expect("bound socket has an address");
        let shutdown_tx = listener.shutdown_handle();
        let task = tokio::spawn(async move { listener.serve(socket).await });

        Self {
            address,
            shutdown_tx,
            task: Some(task),
            metrics,
            router,
            config,
        }
    }

    /// Address the proxy is listening on.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Open a new client connection to the proxy.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(&self) -> Result<TestClient<TcpStream>> {
        TestClient::connect(&self.address.to_string()).await
    }

    /// Stop the proxy and wait for it to drain.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MeshTestHarness {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Builder for a harness with a custom topology.
pub struct TestHarnessBuilder {
    clusters: Vec<ClusterConfig>,
    rules: Vec<ForwardingRule>,
    advertised_address: String,
    max_connections: usize,
}

impl TestHarnessBuilder {
    /// Create a builder with the default test topology.
    #[must_use]
    pub fn new() -> Self {
        Self::empty()
            .cluster("apples", 5)
            .prefix_rule("apples", "apples")
            .cluster("bananas", 3)
            .pattern_rule("banana-.*", "bananas")
    }

    /// Create a builder with no clusters or rules.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            clusters: Vec::new(),
            rules: Vec::new(),
            advertised_address: TEST_ADVERTISED_ADDRESS.to_string(),
            max_connections: 100,
        }
    }

    /// Add an upstream cluster.
    #[must_use]
    pub fn cluster(mut self, name: &str, partition_count: i32) -> Self {
        self.clusters.push(ClusterConfig {
            name: name.to_string(),
            bootstrap_servers: vec![format!("{name}.upstream:9092")],
            partition_count,
        });
        self
    }

    /// Route topics starting with `prefix` to `cluster`.
    #[must_use]
    pub fn prefix_rule(mut self, prefix: &str, cluster: &str) -> Self {
        self.rules.push(ForwardingRule {
            target_cluster: cluster.to_string(),
            topic_prefix: Some(prefix.to_string()),
            topic_pattern: None,
        });
        self
    }

    /// Route topics matching `pattern` to `cluster`.
    #[must_use]
    pub fn pattern_rule(mut self, pattern: &str, cluster: &str) -> Self {
        self.rules.push(ForwardingRule {
            target_cluster: cluster.to_string(),
            topic_prefix: None,
            topic_pattern: Some(pattern.to_string()),
        });
        self
    }

    /// Set the address advertised in Metadata responses.
    #[must_use]
    pub fn advertised_address(mut self, address: &str) -> Self {
        self.advertised_address = address.to_string();
        self
    }

    /// Set the connection limit.
    #[must_use]
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// The configuration the harness will be started with.
    #[must_use]
    pub fn config(&self) -> ProxyConfig {
        ProxyConfig {
            listen: ListenConfig {
                address: "127.0.0.1:0".to_string(),
                advertised_address: Some(self.advertised_address.clone()),
                max_connections: self.max_connections,
            },
            upstream: UpstreamConfig {
                clusters: self.clusters.clone(),
                forwarding_rules: self.rules.clone(),
            },
            metrics: Default::default(),
            logging: Default::default(),
        }
    }

    /// Start the harness.
    pub async fn build(self) -> MeshTestHarness {
        MeshTestHarness::with_config(self.config()).await
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_default_topology() {
        let config = TestHarnessBuilder::new().config();

        assert_eq!(config.upstream.clusters.len(), 2);
        assert_eq!(config.upstream.forwarding_rules.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_harness_starts_and_stops() {
        let mut harness = MeshTestHarness::start().await;

        assert_ne!(harness.address().port(), 0);
        assert_eq!(
            harness.router.advertised_address(),
            ("mesh.test".to_string(), 19092)
        );
        assert!(harness.connect().await.is_ok());

        harness.shutdown().await;
    }
}
