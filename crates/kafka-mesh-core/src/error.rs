//! Domain error types for the Kafka mesh proxy.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No upstream cluster was configured.
    #[error("at least one upstream cluster must be configured")]
    NoClusters,

    /// Two clusters share the same name.
    #[error("duplicate upstream cluster name: {0}")]
    DuplicateCluster(String),

    /// A cluster must expose at least one partition per topic.
    #[error("cluster '{cluster}' must have partition_count >= 1, got {partition_count}")]
    InvalidPartitionCount { cluster: String, partition_count: i32 },

    /// A cluster needs somewhere to bootstrap from.
    #[error("cluster '{0}' has no bootstrap servers")]
    NoBootstrapServers(String),

    /// A forwarding rule points at a cluster that does not exist.
    #[error("forwarding rule targets unknown cluster '{0}'")]
    UnknownTargetCluster(String),

    /// A forwarding rule must carry exactly one topic matcher.
    #[error("forwarding rule for cluster '{0}' must set exactly one of topic_prefix or topic_pattern")]
    InvalidForwardingRule(String),

    /// A topic pattern is not a valid regular expression.
    #[error("invalid topic pattern '{pattern}': {source}")]
    InvalidTopicPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),
}

/// Errors that occur during proxy operation.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// TCP/IO connection error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Failed to decode Kafka protocol message.
    #[error("protocol decode error: {message}")]
    ProtocolDecode { message: String },

    /// Failed to encode Kafka protocol message.
    #[error("protocol encode error: {message}")]
    ProtocolEncode { message: String },

    /// The request type is known to Kafka but this proxy has no handler for
    /// it at the requested version.
    #[error("unsupported request: api_key={api_key}, api_version={api_version}")]
    UnsupportedRequest { api_key: i16, api_version: i16 },

    /// The request could not be decoded far enough to be routed.
    #[error("unknown request: api_key={api_key}, api_version={api_version}")]
    UnknownRequest { api_key: i16, api_version: i16 },

    /// An answer was requested from a command that has not reached `Answered`.
    #[error("request with correlation ID {correlation_id} has no answer yet")]
    AnswerNotReady { correlation_id: i32 },

    /// Work behind a deferred answer failed.
    #[error("request with correlation ID {correlation_id} failed: {reason}")]
    AnswerFailed { correlation_id: i32, reason: String },

    /// A deferred answer was dropped without being delivered.
    #[error("answer for correlation ID {correlation_id} was abandoned")]
    AnswerAbandoned { correlation_id: i32 },

    /// Shutdown signal received.
    #[error("proxy shutting down")]
    Shutdown,
}

impl ProxyError {
    /// Short label used for metrics and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::ProtocolDecode { .. } => "decode",
            Self::ProtocolEncode { .. } => "encode",
            Self::UnsupportedRequest { .. } => "unsupported",
            Self::UnknownRequest { .. } => "unknown",
            Self::AnswerNotReady { .. } => "answer_not_ready",
            Self::AnswerFailed { .. } => "answer_failed",
            Self::AnswerAbandoned { .. } => "answer_abandoned",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_request_display() {
        let err = ProxyError::UnsupportedRequest {
            api_key: 2,
            api_version: 0,
        };
        let message = err.to_string();
        assert!(message.contains("unsupported"));
        assert!(message.contains("api_key=2"));
    }

    #[test]
    fn test_unknown_request_display() {
        let err = ProxyError::UnknownRequest {
            api_key: 42,
            api_version: 42,
        };
        let message = err.to_string();
        assert!(message.contains("unknown"));
        assert!(message.contains("api_key=42"));
        assert!(message.contains("api_version=42"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ProxyError::UnsupportedRequest {
                api_key: 2,
                api_version: 0
            }
            .kind(),
            "unsupported"
        );
        assert_eq!(
            ProxyError::UnknownRequest {
                api_key: 2,
                api_version: 0
            }
            .kind(),
            "unknown"
        );
        assert_eq!(ProxyError::Shutdown.kind(), "shutdown");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidPartitionCount {
            cluster: "apples".to_string(),
            partition_count: 0,
        };
        assert!(err.to_string().contains("apples"));
        assert!(err.to_string().contains('0'));
    }

    #[test]
    fn test_proxy_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "test");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Connection(_)));
    }
}
