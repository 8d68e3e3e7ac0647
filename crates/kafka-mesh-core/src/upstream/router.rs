//! Forwarding-rule based topic router.
//!
//! Resolves topics to upstream clusters using the ordered forwarding rules
//! from configuration. A rule matches either by topic prefix or by an
//! anchored regular expression, and the first matching rule wins.
//!
//! # Usage
//!
//! ```ignore
//! let router = TopicRouter::from_config(&proxy_config)?;
//!
//! // Resolve (and cache) the cluster serving a topic
//! let cluster = router.cluster_for_topic("apples-eu");
//! ```

use dashmap::DashMap;
use regex::Regex;
use tracing::debug;

use crate::config::{ClusterConfig, ProxyConfig};
use crate::error::{ConfigError, ConfigResult};

use super::UpstreamConfiguration;

/// How a forwarding rule selects topics.
#[derive(Debug)]
enum TopicMatcher {
    Prefix(String),
    Pattern(Regex),
}

impl TopicMatcher {
    fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            Self::Pattern(regex) => regex.is_match(topic),
        }
    }
}

/// A compiled forwarding rule: matcher plus index of the target cluster.
#[derive(Debug)]
struct CompiledRule {
    matcher: TopicMatcher,
    cluster: usize,
}

/// Upper bound on cached resolutions. Topics past it are resolved from the
/// rules on every request.
pub const MAX_CACHED_TOPICS: usize = 10_000;

/// Routes topics to upstream clusters.
///
/// Only topics that resolve to a cluster are cached, up to
/// [`MAX_CACHED_TOPICS`]. Client-supplied names that match no rule are never
/// retained.
#[derive(Debug)]
pub struct TopicRouter {
    clusters: Vec<ClusterConfig>,
    rules: Vec<CompiledRule>,
    /// Topic name to index of the resolved cluster.
    resolved: DashMap<String, usize>,
    advertised_host: String,
    advertised_port: i32,
}

impl TopicRouter {
    /// Build a router from validated proxy configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the advertised address cannot be parsed, a rule
    /// targets an unknown cluster or a rule's pattern does not compile.
    pub fn from_config(config: &ProxyConfig) -> ConfigResult<Self> {
        config.validate()?;

        let (advertised_host, advertised_port) = config.listen.parse_advertised_address()?;
        let clusters = config.upstream.clusters.clone();

        let mut rules = Vec::with_capacity(config.upstream.forwarding_rules.len());
        for rule in &config.upstream.forwarding_rules {
            let cluster = clusters
                .iter()
                .position(|c| c.name == rule.target_cluster)
                .ok_or_else(|| {
                    ConfigError::UnknownTargetCluster(rule.target_cluster.clone())
                })?;

            let matcher = match (rule.compile_pattern()?, &rule.topic_prefix) {
                (Some(regex), _) => TopicMatcher::Pattern(regex),
                (None, Some(prefix)) => TopicMatcher::Prefix(prefix.clone()),
                (None, None) => {
                    return Err(ConfigError::InvalidForwardingRule(
                        rule.target_cluster.clone(),
                    ))
                }
            };

            rules.push(CompiledRule { matcher, cluster });
        }

        Ok(Self {
            clusters,
            rules,
            resolved: DashMap::new(),
            advertised_host,
            advertised_port,
        })
    }

    /// Number of resolved topics currently cached.
    #[must_use]
    pub fn cached_topics(&self) -> usize {
        self.resolved.len()
    }

    fn resolve(&self, topic: &str) -> Option<usize> {
        // Fast path: check cache first
        if let Some(entry) = self.resolved.get(topic) {
            return Some(*entry.value());
        }

        let cluster = self
            .rules
            .iter()
            .find(|rule| rule.matcher.matches(topic))
            .map(|rule| rule.cluster);

        debug!(
            topic,
            cluster = cluster.map(|idx| self.clusters[idx].name.as_str()),
            "resolved topic"
        );

        if let Some(idx) = cluster {
            if self.resolved.len() < MAX_CACHED_TOPICS {
                self.resolved.insert(topic.to_string(), idx);
            }
        }
        cluster
    }
}

impl UpstreamConfiguration for TopicRouter {
    fn cluster_for_topic(&self, topic: &str) -> Option<ClusterConfig> {
        self.resolve(topic).map(|idx| self.clusters[idx].clone())
    }

    fn advertised_address(&self) -> (String, i32) {
        (self.advertised_host.clone(), self.advertised_port)
    }
}
