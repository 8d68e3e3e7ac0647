//! Kafka protocol request handlers.
//!
//! Each handler is a command type built by a factory registered in the
//! [`DispatchTable`](crate::mesh::DispatchTable). Handlers answer from proxy
//! state and the upstream configuration; none of them talks to a broker.

pub mod api_versions;
pub mod metadata;

pub use api_versions::ApiVersionsCommand;
pub use metadata::MetadataCommand;

use bytes::BytesMut;
use kafka_protocol::messages::RequestHeader;
use kafka_protocol::protocol::{Encodable, HeaderVersion};

use crate::error::{ProxyError, Result};
use crate::network::codec::ResponseFrame;

/// Encode `response` at the request's version into a frame carrying its
/// correlation ID.
pub(crate) fn encode_answer<R>(header: &RequestHeader, response: &R) -> Result<ResponseFrame>
where
    R: Encodable + HeaderVersion,
{
    let mut body = BytesMut::new();
    response
        .encode(&mut body, header.request_api_version)
        .map_err(|e| ProxyError::ProtocolEncode {
            message: e.to_string(),
        })?;

    Ok(ResponseFrame {
        correlation_id: header.correlation_id,
        header_version: R::header_version(header.request_api_version),
        body,
    })
}
