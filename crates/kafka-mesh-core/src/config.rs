//! Configuration types for the Kafka mesh proxy.
//!
//! Configuration is loaded from YAML files and validated before use.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// TCP listener configuration.
    pub listen: ListenConfig,

    /// Upstream clusters and the rules that route topics to them.
    pub upstream: UpstreamConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// TCP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Address to bind to, e.g., "0.0.0.0:19092".
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// Address that clients should use to connect to this proxy.
    ///
    /// This is the only broker address ever returned in Metadata responses,
    /// so clients never learn about upstream brokers.
    ///
    /// If not set, defaults to the listen address. Supports environment
    /// variable expansion: "${POD_IP}:19092"
    pub advertised_address: Option<String>,

    /// Maximum number of concurrent client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream topology: the clusters behind the proxy and the forwarding rules.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Upstream Kafka clusters.
    pub clusters: Vec<ClusterConfig>,

    /// Topic forwarding rules, evaluated in order. First match wins.
    #[serde(default)]
    pub forwarding_rules: Vec<ForwardingRule>,
}

/// A single upstream Kafka cluster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Unique cluster name, referenced by forwarding rules.
    pub name: String,

    /// Bootstrap servers of the upstream cluster.
    pub bootstrap_servers: Vec<String>,

    /// Number of partitions every topic in this cluster is advertised with.
    pub partition_count: i32,
}

/// Routes matching topics to a target cluster.
///
/// Exactly one of `topic_prefix` or `topic_pattern` must be set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwardingRule {
    /// Name of the cluster that serves matching topics.
    pub target_cluster: String,

    /// Topics starting with this prefix match.
    #[serde(default)]
    pub topic_prefix: Option<String>,

    /// Topics matching this regular expression (anchored) match.
    #[serde(default)]
    pub topic_pattern: Option<String>,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

// Default value functions

fn default_listen_address() -> String {
    "0.0.0.0:19092".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

// Default implementations

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            advertised_address: None,
            max_connections: default_max_connections(),
        }
    }
}

impl ListenConfig {
    /// Get the advertised address for clients.
    ///
    /// Returns the configured `advertised_address` (with environment
    /// variables expanded) if set, otherwise falls back to the `address`.
    #[must_use]
    pub fn get_advertised_address(&self) -> String {
        self.advertised_address
            .as_deref()
            .map_or_else(|| self.address.clone(), expand_env_vars)
    }

    /// Parse the advertised address into host and port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_advertised_address(&self) -> ConfigResult<(String, i32)> {
        let addr = self.get_advertised_address();
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidAddress(addr.clone()))?;
        if host.is_empty() {
            return Err(ConfigError::InvalidAddress(addr.clone()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(addr.clone()))?;
        Ok((host.to_string(), i32::from(port)))
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Configuration loading and validation

impl ProxyConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        self.listen.parse_advertised_address()?;
        self.upstream.validate()
    }
}

impl UpstreamConfig {
    /// Validate clusters and forwarding rules.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - no cluster is configured
    /// - two clusters share a name
    /// - a cluster has no bootstrap servers or a non-positive partition count
    /// - a rule targets an unknown cluster
    /// - a rule sets neither or both of `topic_prefix` / `topic_pattern`
    /// - a topic pattern does not compile
    pub fn validate(&self) -> ConfigResult<()> {
        if self.clusters.is_empty() {
            return Err(ConfigError::NoClusters);
        }

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                return Err(ConfigError::DuplicateCluster(cluster.name.clone()));
            }
            if cluster.partition_count < 1 {
                return Err(ConfigError::InvalidPartitionCount {
                    cluster: cluster.name.clone(),
                    partition_count: cluster.partition_count,
                });
            }
            if cluster.bootstrap_servers.is_empty() {
                return Err(ConfigError::NoBootstrapServers(cluster.name.clone()));
            }
        }

        for rule in &self.forwarding_rules {
            if !names.contains(rule.target_cluster.as_str()) {
                return Err(ConfigError::UnknownTargetCluster(rule.target_cluster.clone()));
            }
            rule.compile_pattern()?;
        }

        Ok(())
    }

    /// Find a cluster by name.
    #[must_use]
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

impl ForwardingRule {
    /// Compile the anchored topic pattern, if this rule uses one.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule does not carry exactly one matcher or the
    /// pattern is not a valid regular expression.
    pub fn compile_pattern(&self) -> ConfigResult<Option<Regex>> {
        match (&self.topic_prefix, &self.topic_pattern) {
            (Some(_), None) => Ok(None),
            (None, Some(pattern)) => Regex::new(&format!("^(?:{pattern})$"))
                .map(Some)
                .map_err(|source| ConfigError::InvalidTopicPattern {
                    pattern: pattern.clone(),
                    source,
                }),
            _ => Err(ConfigError::InvalidForwardingRule(self.target_cluster.clone())),
        }
    }
}
