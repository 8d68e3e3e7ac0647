//! A handler that answers from a spawned task.
//!
//! Stands in for handlers that wait on upstream work. The request body after
//! the header starts with a big-endian `u32` delay in milliseconds; once it
//! elapses the whole body is echoed back as the answer.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::RequestHeader;

use crate::error::Result;
use crate::mesh::{
    AnswerListener, Command, CommandState, DispatchContext, InFlightRequest, Lifecycle,
    RequestBody, RequestEnvelope,
};
use crate::network::codec::ResponseFrame;

/// In-flight request answered after a delay.
#[derive(Debug)]
pub struct DelayedCommand {
    lifecycle: Lifecycle,
    delay: Duration,
    payload: Bytes,
}

impl DelayedCommand {
    /// Create a command answering `payload` after `delay`.
    #[must_use]
    pub fn new(header: RequestHeader, delay: Duration, payload: Bytes) -> Self {
        Self {
            lifecycle: Lifecycle::new(header),
            delay,
            payload,
        }
    }

    /// Factory for dispatch tables.
    ///
    /// Returns `None` unless the body is opaque and at least four bytes long.
    pub fn create(envelope: &RequestEnvelope, _context: &DispatchContext<'_>) -> Option<Command> {
        let RequestBody::Opaque(body) = &envelope.body else {
            return None;
        };
        let millis = body
            .get(..4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))?;

        Some(Command::Custom(Box::new(Self::new(
            envelope.header.clone(),
            Duration::from_millis(u64::from(millis)),
            body.clone(),
        ))))
    }
}

impl InFlightRequest for DelayedCommand {
    fn header(&self) -> &RequestHeader {
        self.lifecycle.header()
    }

    fn state(&self) -> CommandState {
        self.lifecycle.state()
    }

    fn start_processing(&mut self, listener: Arc<dyn AnswerListener>) {
        if !self.lifecycle.can_start() {
            return;
        }

        let pending = self.lifecycle.defer(listener);
        let frame = ResponseFrame {
            correlation_id: self.correlation_id(),
            header_version: 0,
            body: BytesMut::from(&self.payload[..]),
        };
        let delay = self.delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.complete(Ok(frame));
        });
    }

    fn compute_answer(&self) -> Result<ResponseFrame> {
        self.lifecycle.deferred_answer()
    }

    fn complete(&mut self, answer: Result<ResponseFrame>) {
        self.lifecycle.settle(answer);
    }

    fn elapsed(&self) -> Duration {
        self.lifecycle.elapsed()
    }
}

/// Opaque request body asking for an answer after `delay_ms`.
#[must_use]
pub fn delayed_body(delay_ms: u32) -> Vec<u8> {
    // Null client ID, then the delay
    let mut body = vec![0xff, 0xff];
    body.extend_from_slice(&delay_ms.to_be_bytes());
    body
}
