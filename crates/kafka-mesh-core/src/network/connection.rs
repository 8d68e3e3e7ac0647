//! Per-connection request handler.
//!
//! Drives a single client connection: frames are decoded and fed to a
//! [`RequestProcessor`], whose commands queue up in an [`InFlightRequests`].
//! Whenever a command signals that it has an answer (in place, or from a
//! spawned task through a deferred answer), every answered command at the
//! front of the queue is written back, so responses leave in the order the
//! requests arrived.
//!
//! A request the processor rejects closes the connection after any answers
//! already queued ahead of it have been flushed.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, instrument, trace, warn};

use crate::error::{ProxyError, Result};
use crate::mesh::{DispatchTable, InFlightRequest, RequestProcessor};
use crate::metrics::MeshMetrics;
use crate::upstream::UpstreamConfiguration;

use super::codec::{DecodedRequest, KafkaCodec};
use super::in_flight::{AnswerChannel, InFlightRequests};

/// Handles requests for a single client connection.
pub struct ConnectionHandler {
    configuration: Arc<dyn UpstreamConfiguration>,
    dispatch_table: Arc<DispatchTable>,
    metrics: Arc<MeshMetrics>,
    shutdown_rx: broadcast::Receiver<()>,
    connection_id: u64,
}

impl ConnectionHandler {
    /// Create a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `configuration` - Upstream topology shared by all connections
    /// * `dispatch_table` - Handlers shared by all connections
    /// * `metrics` - Metrics registry
    /// * `shutdown_rx` - Receiver for shutdown signals
    /// * `connection_id` - Identifier used in logs
    #[must_use]
    pub fn new(
        configuration: Arc<dyn UpstreamConfiguration>,
        dispatch_table: Arc<DispatchTable>,
        metrics: Arc<MeshMetrics>,
        shutdown_rx: broadcast::Receiver<()>,
        connection_id: u64,
    ) -> Self {
        Self {
            configuration,
            dispatch_table,
            metrics,
            shutdown_rx,
            connection_id,
        }
    }

    /// Handle the connection, processing requests until disconnect or shutdown.
    ///
    /// # Errors
    ///
    /// Returns the processor's error for a rejected request, a decode error
    /// for an unframeable stream, an I/O error, or [`ProxyError::Shutdown`].
    #[instrument(skip(self, stream), fields(connection_id = self.connection_id))]
    pub async fn handle<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("client connected");

        let (answers, mut ready_rx) = AnswerChannel::new();
        let mut processor = RequestProcessor::new(
            InFlightRequests::new(Arc::new(answers)),
            Arc::clone(&self.configuration),
            Arc::clone(&self.dispatch_table),
        );
        let mut framed = Framed::new(stream, KafkaCodec::new());

        let result = loop {
            tokio::select! {
                decoded = framed.next() => {
                    match decoded {
                        Some(Ok(decoded)) => {
                            if let Err(e) = self.process(&mut processor, decoded) {
                                // Answers queued ahead of the rejected request still go out
                                let flushed = self.flush_answers(&mut framed, processor.listener_mut()).await;
                                break flushed.and(Err(e));
                            }
                        }
                        Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                            warn!(error = %e, "protocol decode error");
                            break Err(ProxyError::ProtocolDecode {
                                message: e.to_string(),
                            });
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "connection read failed");
                            break Err(ProxyError::Connection(e));
                        }
                        None => {
                            debug!("client disconnected");
                            break Ok(());
                        }
                    }
                }
                Some(event) = ready_rx.recv() => {
                    let requests = processor.listener_mut();
                    requests.apply(event);
                    // One flush covers every notification queued so far
                    while let Ok(event) = ready_rx.try_recv() {
                        requests.apply(event);
                    }
                    if let Err(e) = self.flush_answers(&mut framed, requests).await {
                        break Err(e);
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    debug!("shutdown during connection handling");
                    break Err(ProxyError::Shutdown);
                }
            }
        };

        let abandoned = processor.listener().len();
        if abandoned > 0 {
            debug!(abandoned, "dropping unanswered requests");
            self.metrics.discard_in_flight(abandoned);
        }
        result
    }

    /// Feed one decoded frame to the processor.
    fn process(
        &self,
        processor: &mut RequestProcessor<InFlightRequests>,
        decoded: DecodedRequest,
    ) -> Result<()> {
        let (api_key, result) = match decoded {
            DecodedRequest::Request(envelope) => {
                debug!(
                    api_key = envelope.api_key(),
                    api_version = envelope.api_version(),
                    correlation_id = envelope.correlation_id(),
                    "received request"
                );
                (envelope.api_key(), processor.on_message(envelope))
            }
            DecodedRequest::ParseFailure(failure) => {
                (failure.api_key(), processor.on_failed_parse(&failure))
            }
        };

        match result {
            Ok(()) => {
                self.metrics.record_request(api_key);
                Ok(())
            }
            Err(e) => {
                warn!(api_key, error = %e, "request rejected, closing connection");
                self.metrics.record_error(api_key, e.kind());
                Err(e)
            }
        }
    }

    /// Write every answered command at the front of the queue.
    async fn flush_answers<S>(
        &self,
        framed: &mut Framed<S, KafkaCodec>,
        requests: &mut InFlightRequests,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(command) = requests.pop_answered() {
            let frame = match command.compute_answer() {
                Ok(frame) => frame,
                Err(e) => {
                    self.metrics.record_error(command.api_key(), e.kind());
                    self.metrics.discard_in_flight(1);
                    return Err(e);
                }
            };

            let bytes = frame.body.len();
            framed.send(frame).await?;

            self.metrics
                .record_answer(command.api_key(), command.elapsed().as_secs_f64(), bytes);
            trace!(
                correlation_id = command.correlation_id(),
                kind = ?command.kind(),
                bytes,
                "sent answer"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kafka_protocol::messages::{
        ApiKey, ApiVersionsRequest, ApiVersionsResponse, MetadataRequest, MetadataResponse,
    };
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::handlers::ApiVersionsCommand;
    use crate::handlers::api_versions::API_VERSIONS_VERSIONS;
    use crate::mesh::SupportedVersions;
    use crate::testing::client::TestClient;
    use crate::testing::delayed::{delayed_body, DelayedCommand};
    use crate::testing::mocks::MockUpstream;

    fn spawn_handler(
        stream: tokio::io::DuplexStream,
    ) -> (JoinHandle<Result<()>>, broadcast::Sender<()>, Arc<MeshMetrics>) {
        spawn_handler_with(stream, DispatchTable::standard())
    }

    fn spawn_handler_with(
        stream: tokio::io::DuplexStream,
        table: DispatchTable,
    ) -> (JoinHandle<Result<()>>, broadcast::Sender<()>, Arc<MeshMetrics>) {
        let mut upstream = MockUpstream::new();
        upstream
            .expect_advertised_address()
            .return_const(("mesh.local".to_string(), 19092));
        upstream.expect_cluster_for_topic().return_const(None);

        let metrics = Arc::new(MeshMetrics::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handler = ConnectionHandler::new(
            Arc::new(upstream),
            Arc::new(table),
            Arc::clone(&metrics),
            shutdown_rx,
            1,
        );
        let task = tokio::spawn(handler.handle(stream));
        (task, shutdown_tx, metrics)
    }

    #[tokio::test]
    async fn test_answers_api_versions() {
        let (client, server) = duplex(64 * 1024);
        let (task, _shutdown, metrics) = spawn_handler(server);
        let mut client = TestClient::new(client);

        let sent = client
            .send(ApiKey::ApiVersions as i16, 3, &ApiVersionsRequest::default())
            .await
            .unwrap();
        let (correlation_id, response) = client.receive::<ApiVersionsResponse>(3).await.unwrap();

        assert_eq!(correlation_id, sent);
        assert_eq!(response.error_code, 0);
        assert_eq!(response.api_keys.len(), 2);

        drop(client);
        assert!(task.await.unwrap().is_ok());
        assert_eq!(metrics.in_flight_requests.get(), 0);
    }

    #[tokio::test]
    async fn test_pipelined_answers_keep_request_order() {
        let (client, server) = duplex(64 * 1024);
        let (_task, _shutdown, _metrics) = spawn_handler(server);
        let mut client = TestClient::new(client);

        let first = client
            .send(ApiKey::Metadata as i16, 1, &MetadataRequest::default())
            .await
            .unwrap();
        let second = client
            .send(ApiKey::ApiVersions as i16, 0, &ApiVersionsRequest::default())
            .await
            .unwrap();

        let (id, _) = client.receive::<MetadataResponse>(1).await.unwrap();
        assert_eq!(id, first);
        let (id, _) = client.receive::<ApiVersionsResponse>(0).await.unwrap();
        assert_eq!(id, second);
    }

    #[tokio::test]
    async fn test_unsupported_request_closes_connection() {
        let (client, server) = duplex(64 * 1024);
        let (task, _shutdown, metrics) = spawn_handler(server);
        let mut client = TestClient::new(client);

        let sent = client
            .send(ApiKey::ApiVersions as i16, 0, &ApiVersionsRequest::default())
            .await
            .unwrap();
        // ListOffsets v0: null client_id, then a body the mesh never looks at
        client
            .send_raw(ApiKey::ListOffsets as i16, 0, &[0xff, 0xff, 0, 0, 0, 0])
            .await
            .unwrap();

        // The earlier answer is still delivered
        let (id, _) = client.receive::<ApiVersionsResponse>(0).await.unwrap();
        assert_eq!(id, sent);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ProxyError::UnsupportedRequest { .. })));
        assert!(client.is_closed().await);

        let output = metrics.encode().unwrap();
        assert!(output.contains("error_type=\"unsupported\""));
    }

    #[tokio::test]
    async fn test_unknown_api_key_closes_connection() {
        let (client, server) = duplex(64 * 1024);
        let (task, _shutdown, _metrics) = spawn_handler(server);
        let mut client = TestClient::new(client);

        client.send_raw(9999, 0, &[]).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(ProxyError::UnknownRequest {
                api_key: 9999,
                api_version: 0
            })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_handler() {
        let (client, server) = duplex(1024);
        let (task, shutdown, _metrics) = spawn_handler(server);

        shutdown.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(result, Err(ProxyError::Shutdown)));
        drop(client);
    }

    #[tokio::test]
    async fn test_deferred_answer_flushes_in_request_order() {
        let table = DispatchTable::builder()
            .register(
                ApiKey::ApiVersions,
                API_VERSIONS_VERSIONS,
                ApiVersionsCommand::create,
            )
            .register(
                ApiKey::ListOffsets,
                SupportedVersions::new(0, 0),
                DelayedCommand::create,
            )
            .build();
        let (client, server) = duplex(64 * 1024);
        let (task, _shutdown, metrics) = spawn_handler_with(server, table);
        let mut client = TestClient::new(client);

        // The first request finishes well after the second
        let slow = client
            .send_raw(ApiKey::ListOffsets as i16, 0, &delayed_body(100))
            .await
            .unwrap();
        let fast = client
            .send(ApiKey::ApiVersions as i16, 0, &ApiVersionsRequest::default())
            .await
            .unwrap();

        let (id, body) = client.receive_raw().await.unwrap();
        assert_eq!(id, slow);
        assert_eq!(&body[..], &100u32.to_be_bytes());

        let (id, response) = client.receive::<ApiVersionsResponse>(0).await.unwrap();
        assert_eq!(id, fast);
        assert_eq!(response.error_code, 0);

        drop(client);
        assert!(task.await.unwrap().is_ok());
        assert_eq!(metrics.in_flight_requests.get(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_inside_frame_is_connection_error() {
        let (mut client, server) = duplex(1024);
        let (task, _shutdown, _metrics) = spawn_handler(server);

        // Length prefix promising more than is ever sent
        client.write_all(&[0, 0, 0, 100, 0, 18]).await.unwrap();
        drop(client);

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(ProxyError::Connection(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_decode_error() {
        let (mut client, server) = duplex(1024);
        let (task, _shutdown, _metrics) = spawn_handler(server);

        client.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ProxyError::ProtocolDecode { .. })));
    }
}
