//! Kafka protocol frame codec.
//!
//! Implements tokio's `Decoder` and `Encoder` traits for Kafka wire protocol frames.
//! Kafka uses a simple framing format: 4-byte big-endian length prefix followed by
//! the message bytes.
//!
//! Decoding goes one step further than framing: the request header is parsed
//! and, for the request types the mesh handles, so is the body. Anything that
//! frames correctly but cannot be parsed is reported as a
//! [`RequestParseFailure`] rather than an I/O error, so the connection can
//! decide what to do with it.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{
    ApiKey, ApiVersionsRequest, MetadataRequest, RequestHeader, ResponseHeader,
};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, Message};
use tokio_util::codec::{Decoder, Encoder};

use crate::mesh::envelope::{request_header, RequestBody, RequestEnvelope, RequestParseFailure};

/// Maximum frame size (100 MB by default).
const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Header version without tagged fields, understood by every request type.
const NON_FLEXIBLE_HEADER_VERSION: i16 = 1;

/// Outcome of decoding one frame.
#[derive(Debug)]
pub enum DecodedRequest {
    /// Header and body decoded.
    Request(Arc<RequestEnvelope>),
    /// The frame could not be parsed past its fixed header fields.
    ParseFailure(RequestParseFailure),
}

/// Codec for Kafka wire protocol frames.
///
/// Kafka messages are framed as:
/// - 4 bytes: message length (big-endian, excludes these 4 bytes)
/// - N bytes: message content
///
/// The first 8 bytes of the message content contain:
/// - 2 bytes: API key
/// - 2 bytes: API version
/// - 4 bytes: correlation ID
#[derive(Debug, Clone)]
pub struct KafkaCodec {
    max_frame_size: usize,
}

impl KafkaCodec {
    /// Create a new codec with default max frame size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a new codec with custom max frame size.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for KafkaCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for KafkaCodec {
    type Item = DecodedRequest;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for the length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame size {length} exceeds maximum {}",
                    self.max_frame_size
                ),
            ));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let bytes = src.split_to(length).freeze();

        if bytes.len() < 8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame too small for request header",
            ));
        }

        let api_key_raw = i16::from_be_bytes([bytes[0], bytes[1]]);
        let api_version = i16::from_be_bytes([bytes[2], bytes[3]]);
        let correlation_id = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let fallback = request_header(api_key_raw, api_version, correlation_id);

        let decoded = match ApiKey::try_from(api_key_raw) {
            Ok(ApiKey::Metadata) => {
                decode_typed::<MetadataRequest>(bytes, fallback, RequestBody::Metadata)
            }
            Ok(ApiKey::ApiVersions) => {
                decode_typed::<ApiVersionsRequest>(bytes, fallback, RequestBody::ApiVersions)
            }
            Ok(_) => decode_opaque(bytes, fallback),
            Err(_) => DecodedRequest::ParseFailure(RequestParseFailure::new(
                fallback,
                format!("unknown API key: {api_key_raw}"),
            )),
        };

        Ok(Some(decoded))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(decoded) => Ok(Some(decoded)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed inside a frame ({} bytes buffered)", src.len()),
            )),
        }
    }
}

fn decode_typed<R>(
    mut bytes: Bytes,
    fallback: RequestHeader,
    wrap: fn(R) -> RequestBody,
) -> DecodedRequest
where
    R: Decodable + HeaderVersion + Message,
{
    let api_version = fallback.request_api_version;
    if api_version < R::VERSIONS.min || api_version > R::VERSIONS.max {
        return DecodedRequest::ParseFailure(RequestParseFailure::new(
            fallback,
            format!("version {api_version} outside protocol range"),
        ));
    }

    let header = match RequestHeader::decode(&mut bytes, R::header_version(api_version)) {
        Ok(header) => header,
        Err(e) => {
            return DecodedRequest::ParseFailure(RequestParseFailure::new(
                fallback,
                format!("header: {e}"),
            ))
        }
    };

    match R::decode(&mut bytes, api_version) {
        Ok(body) => DecodedRequest::Request(Arc::new(RequestEnvelope::new(header, wrap(body)))),
        Err(e) => DecodedRequest::ParseFailure(RequestParseFailure::new(
            fallback,
            format!("body: {e}"),
        )),
    }
}

fn decode_opaque(mut bytes: Bytes, fallback: RequestHeader) -> DecodedRequest {
    match RequestHeader::decode(&mut bytes, NON_FLEXIBLE_HEADER_VERSION) {
        Ok(header) => DecodedRequest::Request(Arc::new(RequestEnvelope::new(
            header,
            RequestBody::Opaque(bytes),
        ))),
        Err(e) => DecodedRequest::ParseFailure(RequestParseFailure::new(
            fallback,
            format!("header: {e}"),
        )),
    }
}

/// A response frame to be encoded.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    /// The correlation ID (must match the request).
    pub correlation_id: i32,
    /// Response header version for this API key and version.
    pub header_version: i16,
    /// The response body bytes.
    pub body: BytesMut,
}

impl Encoder<ResponseFrame> for KafkaCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ResponseFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut header = ResponseHeader::default();
        header.correlation_id = item.correlation_id;

        let mut header_bytes = BytesMut::new();
        header
            .encode(&mut header_bytes, item.header_version)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        let total_len = header_bytes.len() + item.body.len();

        dst.reserve(4 + total_len);
        dst.put_u32(total_len as u32);
        dst.extend_from_slice(&header_bytes);
        dst.extend_from_slice(&item.body);

        Ok(())
    }
}
