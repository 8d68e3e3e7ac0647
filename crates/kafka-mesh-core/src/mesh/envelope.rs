//! Decoded request envelopes and decode-failure records.
//!
//! Envelopes are produced by the wire codec and shared read-only with the
//! request processor. Handlers copy whatever they need out of an envelope at
//! construction time and never hold on to it.

use bytes::Bytes;
use kafka_protocol::messages::{ApiVersionsRequest, MetadataRequest, RequestHeader};

/// Type-specific body of a decoded request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// A Metadata request.
    Metadata(MetadataRequest),
    /// An ApiVersions request.
    ApiVersions(ApiVersionsRequest),
    /// A request type the codec does not model. The bytes after the header
    /// are kept as-is.
    Opaque(Bytes),
}

/// A decoded request: header plus type-specific body.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// The request header.
    pub header: RequestHeader,
    /// The decoded body.
    pub body: RequestBody,
}

impl RequestEnvelope {
    /// Create an envelope from a decoded header and body.
    #[must_use]
    pub fn new(header: RequestHeader, body: RequestBody) -> Self {
        Self { header, body }
    }

    /// The request-type identifier (API key).
    #[must_use]
    pub fn api_key(&self) -> i16 {
        self.header.request_api_key
    }

    /// The protocol version of the request.
    #[must_use]
    pub fn api_version(&self) -> i16 {
        self.header.request_api_version
    }

    /// The correlation ID the client expects back in the answer.
    #[must_use]
    pub fn correlation_id(&self) -> i32 {
        self.header.correlation_id
    }
}

/// A request whose header could be read but whose body could not be decoded.
#[derive(Debug, Clone)]
pub struct RequestParseFailure {
    /// As much of the header as could be recovered.
    pub header: RequestHeader,
    /// Why decoding failed.
    pub reason: String,
}

impl RequestParseFailure {
    /// Create a failure record.
    #[must_use]
    pub fn new(header: RequestHeader, reason: impl Into<String>) -> Self {
        Self {
            header,
            reason: reason.into(),
        }
    }

    /// The API key advertised by the header.
    #[must_use]
    pub fn api_key(&self) -> i16 {
        self.header.request_api_key
    }

    /// The API version advertised by the header.
    #[must_use]
    pub fn api_version(&self) -> i16 {
        self.header.request_api_version
    }
}

/// Build a request header from the three fixed header fields.
#[must_use]
pub fn request_header(api_key: i16, api_version: i16, correlation_id: i32) -> RequestHeader {
    let mut header = RequestHeader::default();
    header.request_api_key = api_key;
    header.request_api_version = api_version;
    header.correlation_id = correlation_id;
    header
}
