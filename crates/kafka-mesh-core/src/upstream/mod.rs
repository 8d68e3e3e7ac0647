//! Upstream cluster topology as seen by request handlers.
//!
//! Handlers never talk to upstream brokers directly while being dispatched.
//! They only ask two questions: which cluster owns a topic, and which address
//! the proxy advertises to its clients in place of real brokers.

pub mod router;

pub use router::{TopicRouter, MAX_CACHED_TOPICS};

pub use crate::config::ClusterConfig;

/// Query-only view of the upstream topology.
///
/// Implementations must be cheap to call and must never block: commands query
/// them from the connection task.
pub trait UpstreamConfiguration: Send + Sync {
    /// Resolve the upstream cluster responsible for `topic`.
    ///
    /// Returns `None` when no forwarding rule matches.
    fn cluster_for_topic(&self, topic: &str) -> Option<ClusterConfig>;

    /// The `(host, port)` identity the proxy presents to clients.
    fn advertised_address(&self) -> (String, i32);
}
