//! Kafka Mesh Proxy Core Library
//!
//! This library provides the request-dispatch core of a Kafka mesh proxy: a
//! single endpoint that presents several upstream Kafka clusters to clients
//! as one broker.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`mesh`] - Request processor, dispatch table and command lifecycle
//! - [`handlers`] - Metadata and ApiVersions commands
//! - [`upstream`] - Topic to upstream cluster routing
//! - [`network`] - TCP listener, Kafka frame codec and per-connection queue
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kafka_mesh_core::{MeshMetrics, ProxyConfig, ProxyListener, TopicRouter};
//!
//! let config = ProxyConfig::from_file("config.yaml")?;
//! let router = Arc::new(TopicRouter::from_config(&config)?);
//! let listener = ProxyListener::new(config, router, Arc::new(MeshMetrics::new()));
//! listener.run().await?;
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod mesh;
pub mod metrics;
pub mod network;
pub mod upstream;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use config::{ClusterConfig, ForwardingRule, ProxyConfig};
pub use error::{ConfigError, ProxyError, Result};
pub use mesh::{Command, DispatchTable, RequestEnvelope, RequestProcessor};
pub use metrics::MeshMetrics;
pub use network::ProxyListener;
pub use upstream::{TopicRouter, UpstreamConfiguration};
