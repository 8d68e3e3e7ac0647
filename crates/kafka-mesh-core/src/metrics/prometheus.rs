//! Prometheus metrics for the Kafka mesh proxy.
//!
//! Provides counters, histograms, and gauges for monitoring proxy health
//! and performance.

use kafka_protocol::messages::ApiKey;
use prometheus::{
    Counter, CounterVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Label value for an API key: the Kafka name, or `unknown` for keys outside
/// the protocol.
#[must_use]
pub fn api_key_label(api_key: i16) -> String {
    ApiKey::try_from(api_key).map_or_else(|_| "unknown".to_string(), |key| format!("{key:?}"))
}

/// Proxy metrics collection.
///
/// One instance is shared by every connection of a listener.
pub struct MeshMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Requests dispatched to a handler, by API key.
    pub requests_total: CounterVec,

    /// Requests rejected or failed, by API key and error kind.
    pub requests_errors: CounterVec,

    /// Time from dispatch to flushed answer, by API key.
    pub request_duration_seconds: HistogramVec,

    /// Current active client connections.
    pub active_client_connections: IntGauge,

    /// Commands queued across all connections, answered or not.
    pub in_flight_requests: IntGauge,

    /// Total bytes of answers written to clients.
    pub bytes_sent: Counter,
}

impl MeshMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new(
                "kafka_mesh_requests_total",
                "Total number of requests dispatched by API key",
            ),
            &["api_key"],
        )
        .expect("metric creation should succeed");

        let requests_errors = CounterVec::new(
            Opts::new(
                "kafka_mesh_requests_errors_total",
                "Total number of request errors by API key and error type",
            ),
            &["api_key", "error_type"],
        )
        .expect("metric creation should succeed");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "kafka_mesh_request_duration_seconds",
                "Request latency in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
            &["api_key"],
        )
        .expect("metric creation should succeed");

        let active_client_connections = IntGauge::new(
            "kafka_mesh_active_client_connections",
            "Current number of active client connections",
        )
        .expect("metric creation should succeed");

        let in_flight_requests = IntGauge::new(
            "kafka_mesh_in_flight_requests",
            "Current number of requests awaiting their answer",
        )
        .expect("metric creation should succeed");

        let bytes_sent = Counter::new(
            "kafka_mesh_bytes_sent_total",
            "Total response bytes sent to clients",
        )
        .expect("metric creation should succeed");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(requests_errors.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(active_client_connections.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(in_flight_requests.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(bytes_sent.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            requests_total,
            requests_errors,
            request_duration_seconds,
            active_client_connections,
            in_flight_requests,
            bytes_sent,
        }
    }

    /// Record a request handed to a handler.
    pub fn record_request(&self, api_key: i16) {
        self.requests_total
            .with_label_values(&[api_key_label(api_key).as_str()])
            .inc();
        self.in_flight_requests.inc();
    }

    /// Record a rejected or failed request.
    pub fn record_error(&self, api_key: i16, error_type: &str) {
        self.requests_errors
            .with_label_values(&[api_key_label(api_key).as_str(), error_type])
            .inc();
    }

    /// Record an answer written back to the client.
    pub fn record_answer(&self, api_key: i16, duration_seconds: f64, bytes: usize) {
        self.request_duration_seconds
            .with_label_values(&[api_key_label(api_key).as_str()])
            .observe(duration_seconds);
        self.in_flight_requests.dec();
        self.bytes_sent.inc_by(bytes as f64);
    }

    /// Forget commands dropped unanswered when a connection closes.
    pub fn discard_in_flight(&self, count: usize) {
        self.in_flight_requests.sub(count as i64);
    }

    /// Increment active client connections.
    pub fn inc_client_connections(&self) {
        self.active_client_connections.inc();
    }

    /// Decrement active client connections.
    pub fn dec_client_connections(&self) {
        self.active_client_connections.dec();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for MeshMetrics {
    fn default() -> Self {
        Self::new()
    }
}
