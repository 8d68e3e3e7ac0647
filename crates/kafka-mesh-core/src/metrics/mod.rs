//! Metrics collection for the Kafka mesh proxy.
//!
//! Provides Prometheus-compatible metrics for monitoring dispatch outcomes,
//! request latency, and connection statistics.

pub mod prometheus;

pub use prometheus::{api_key_label, MeshMetrics};
