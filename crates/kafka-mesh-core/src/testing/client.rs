//! Minimal Kafka client for driving the proxy in tests.
//!
//! Speaks just enough of the wire protocol to send typed or raw requests and
//! decode typed responses. Works over any async byte stream, so the same
//! client drives a TCP socket or an in-memory duplex pipe.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::ResponseHeader;
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, StrBytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ProxyError, Result};
use crate::mesh::envelope::request_header;

/// Client ID sent with every typed request.
pub const TEST_CLIENT_ID: &str = "kafka-mesh-test";

/// Encode a complete request frame, length prefix included.
///
/// # Errors
///
/// Returns an error if the request cannot be encoded at `api_version`.
pub fn encode_request<R>(
    api_key: i16,
    api_version: i16,
    correlation_id: i32,
    request: &R,
) -> Result<BytesMut>
where
    R: Encodable + HeaderVersion,
{
    let mut header = request_header(api_key, api_version, correlation_id);
    header.client_id = Some(StrBytes::from_static_str(TEST_CLIENT_ID));

    let mut payload = BytesMut::new();
    header
        .encode(&mut payload, R::header_version(api_version))
        .map_err(encode_error)?;
    request
        .encode(&mut payload, api_version)
        .map_err(encode_error)?;

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn encode_error(e: impl std::fmt::Display) -> ProxyError {
    ProxyError::ProtocolEncode {
        message: e.to_string(),
    }
}

fn decode_error(e: impl std::fmt::Display) -> ProxyError {
    ProxyError::ProtocolDecode {
        message: e.to_string(),
    }
}

/// Test client over an async stream.
pub struct TestClient<S> {
    stream: S,
    next_correlation_id: i32,
}

impl TestClient<TcpStream> {
    /// Connect to a proxy over TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(address: &str) -> Result<Self> {
        Ok(Self::new(TcpStream::connect(address).await?))
    }
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            next_correlation_id: 1,
        }
    }

    fn next_correlation_id(&mut self) -> i32 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    /// Send a typed request. Returns the correlation ID used.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub async fn send<R>(&mut self, api_key: i16, api_version: i16, request: &R) -> Result<i32>
    where
        R: Encodable + HeaderVersion,
    {
        let correlation_id = self.next_correlation_id();
        let frame = encode_request(api_key, api_version, correlation_id, request)?;
        self.stream.write_all(&frame).await?;
        Ok(correlation_id)
    }

    /// Send a frame made of the fixed header fields followed by `body`
    /// verbatim. Returns the correlation ID used.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub async fn send_raw(&mut self, api_key: i16, api_version: i16, body: &[u8]) -> Result<i32> {
        let correlation_id = self.next_correlation_id();

        let mut frame = BytesMut::with_capacity(12 + body.len());
        frame.put_u32((8 + body.len()) as u32);
        frame.put_i16(api_key);
        frame.put_i16(api_version);
        frame.put_i32(correlation_id);
        frame.extend_from_slice(body);

        self.stream.write_all(&frame).await?;
        Ok(correlation_id)
    }

    /// Read one response and decode it as `R` at `api_version`.
    ///
    /// Returns the correlation ID from the response header with the body.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or decoding fails.
    pub async fn receive<R>(&mut self, api_version: i16) -> Result<(i32, R)>
    where
        R: Decodable + HeaderVersion,
    {
        let length = self.stream.read_u32().await? as usize;
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await?;

        let mut payload = Bytes::from(payload);
        let header = ResponseHeader::decode(&mut payload, R::header_version(api_version))
            .map_err(decode_error)?;
        let body = R::decode(&mut payload, api_version).map_err(decode_error)?;
        Ok((header.correlation_id, body))
    }

    /// Read one response without decoding its body.
    ///
    /// Expects a response header without tagged fields.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or decoding the header fails.
    pub async fn receive_raw(&mut self) -> Result<(i32, Bytes)> {
        let length = self.stream.read_u32().await? as usize;
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await?;

        let mut payload = Bytes::from(payload);
        let header = ResponseHeader::decode(&mut payload, 0).map_err(decode_error)?;
        Ok((header.correlation_id, payload))
    }

    /// Whether the proxy has closed the connection.
    ///
    /// Waits up to one second for EOF.
    pub async fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(
            tokio::time::timeout(Duration::from_secs(1), self.stream.read(&mut buf)).await,
            Ok(Ok(0) | Err(_))
        )
    }
}
