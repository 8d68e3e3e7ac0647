//! Per-connection queue of in-flight requests.
//!
//! Kafka clients match answers to requests by correlation ID but expect them
//! in request order on a given connection. Commands are therefore queued in
//! arrival order and only popped from the front, once answered. Commands that
//! finish out of order wait in the queue until everything ahead of them is
//! answered.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::Result;
use crate::mesh::{AnswerListener, Command, InFlightRequest, RequestListener};

use super::codec::ResponseFrame;

/// Notification from a command to its connection task.
#[derive(Debug)]
pub enum AnswerEvent {
    /// The command answered in place.
    Ready(i32),
    /// A deferred command's answer, to be applied to the queued command.
    Computed {
        /// Correlation ID of the waiting request.
        correlation_id: i32,
        /// The answer or the reason there is none.
        answer: Result<ResponseFrame>,
    },
}

/// Forwards notifications to the connection task.
#[derive(Debug, Clone)]
pub struct AnswerChannel {
    tx: mpsc::UnboundedSender<AnswerEvent>,
}

impl AnswerChannel {
    /// Create a channel and the receiver the connection task polls.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AnswerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, correlation_id: i32, event: AnswerEvent) {
        // Receiver gone means the connection is closing
        if self.tx.send(event).is_err() {
            trace!(correlation_id, "answer for closed connection dropped");
        }
    }
}

impl AnswerListener for AnswerChannel {
    fn on_request_ready_for_answer(&self, correlation_id: i32) {
        self.send(correlation_id, AnswerEvent::Ready(correlation_id));
    }

    fn on_answer_computed(&self, correlation_id: i32, answer: Result<ResponseFrame>) {
        self.send(
            correlation_id,
            AnswerEvent::Computed {
                correlation_id,
                answer,
            },
        );
    }
}

/// FIFO of commands owned by one connection.
pub struct InFlightRequests {
    queue: VecDeque<Command>,
    answers: Arc<dyn AnswerListener>,
}

impl InFlightRequests {
    /// Create an empty queue whose commands notify `answers`.
    #[must_use]
    pub fn new(answers: Arc<dyn AnswerListener>) -> Self {
        Self {
            queue: VecDeque::new(),
            answers,
        }
    }

    /// Number of commands awaiting flush.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Apply a notification from [`AnswerChannel`].
    pub fn apply(&mut self, event: AnswerEvent) {
        match event {
            AnswerEvent::Ready(correlation_id) => trace!(correlation_id, "answer ready"),
            AnswerEvent::Computed {
                correlation_id,
                answer,
            } => {
                self.complete(correlation_id, answer);
            }
        }
    }

    /// Hand a deferred answer to the oldest unanswered command with
    /// `correlation_id`. Returns `false` if there is none.
    pub fn complete(&mut self, correlation_id: i32, answer: Result<ResponseFrame>) -> bool {
        let waiting = self
            .queue
            .iter_mut()
            .find(|command| command.correlation_id() == correlation_id && !command.finished());

        match waiting {
            Some(command) => {
                command.complete(answer);
                true
            }
            None => {
                warn!(correlation_id, "deferred answer for unknown request dropped");
                false
            }
        }
    }

    /// Pop the front command if it has been answered.
    ///
    /// Later commands wait behind an unanswered one even if they are ready.
    pub fn pop_answered(&mut self) -> Option<Command> {
        if self.queue.front()?.finished() {
            self.queue.pop_front()
        } else {
            None
        }
    }
}

impl RequestListener for InFlightRequests {
    fn on_request(&mut self, command: Command) {
        self.queue.push_back(command);
        if let Some(command) = self.queue.back_mut() {
            command.start_processing(Arc::clone(&self.answers));
        }
    }
}

#[cfg(test)]
mod tests {
    use kafka_protocol::messages::{ApiKey, ApiVersionsRequest, MetadataRequest};

    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::error::ProxyError;
    use crate::handlers::{ApiVersionsCommand, MetadataCommand};
    use crate::mesh::{request_header, CommandState, RequestBody, RequestEnvelope};
    use crate::testing::delayed::DelayedCommand;
    use crate::testing::mocks::MockUpstream;

    fn api_versions(correlation_id: i32) -> Command {
        let envelope = RequestEnvelope::new(
            request_header(ApiKey::ApiVersions as i16, 0, correlation_id),
            RequestBody::ApiVersions(ApiVersionsRequest::default()),
        );
        Command::ApiVersions(ApiVersionsCommand::new(&envelope, Vec::new()))
    }

    fn metadata(correlation_id: i32) -> Command {
        let envelope = RequestEnvelope::new(
            request_header(ApiKey::Metadata as i16, 1, correlation_id),
            RequestBody::Metadata(MetadataRequest::default()),
        );
        let mut upstream = MockUpstream::new();
        upstream
            .expect_advertised_address()
            .return_const(("localhost".to_string(), 19092));
        Command::Metadata(MetadataCommand::new(&envelope, None, Arc::new(upstream)))
    }

    #[tokio::test]
    async fn test_on_request_starts_processing_and_notifies() {
        let (channel, mut rx) = AnswerChannel::new();
        let mut requests = InFlightRequests::new(Arc::new(channel));

        requests.on_request(api_versions(1));
        requests.on_request(metadata(2));

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn test_pop_answered_in_order() {
        let (channel, _rx) = AnswerChannel::new();
        let mut requests = InFlightRequests::new(Arc::new(channel));

        requests.on_request(metadata(10));
        requests.on_request(api_versions(11));

        assert_eq!(requests.pop_answered().map(|c| c.correlation_id()), Some(10));
        assert_eq!(requests.pop_answered().map(|c| c.correlation_id()), Some(11));
        assert!(requests.pop_answered().is_none());
        assert!(requests.is_empty());
    }

    #[test]
    fn test_unanswered_front_blocks_queue() {
        let (channel, _rx) = AnswerChannel::new();
        let mut requests = InFlightRequests::new(Arc::new(channel));

        // Queued without starting, as if still waiting on upstream work
        requests.queue.push_back(api_versions(1));
        requests.on_request(api_versions(2));

        assert!(requests.pop_answered().is_none());
        assert_eq!(requests.len(), 2);
    }

    fn delayed(correlation_id: i32, delay_ms: u64) -> Command {
        Command::Custom(Box::new(DelayedCommand::new(
            request_header(ApiKey::ListOffsets as i16, 0, correlation_id),
            Duration::from_millis(delay_ms),
            Bytes::from_static(b"late"),
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_completion_pops_in_arrival_order() {
        let (channel, mut rx) = AnswerChannel::new();
        let mut requests = InFlightRequests::new(Arc::new(channel));

        requests.on_request(delayed(1, 50));
        requests.on_request(delayed(2, 10));
        requests.on_request(api_versions(3));

        // The in-place answer is announced first, then the faster deferred one
        assert!(matches!(rx.recv().await, Some(AnswerEvent::Ready(3))));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, AnswerEvent::Computed { correlation_id: 2, .. }));
        requests.apply(event);

        // Answered, but still behind the first request
        assert!(requests.pop_answered().is_none());
        assert_eq!(requests.len(), 3);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, AnswerEvent::Computed { correlation_id: 1, .. }));
        requests.apply(event);

        let order: Vec<_> = std::iter::from_fn(|| requests.pop_answered())
            .map(|command| command.correlation_id())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_complete_targets_waiting_command() {
        let (channel, _rx) = AnswerChannel::new();
        let mut requests = InFlightRequests::new(Arc::new(channel));

        requests.on_request(delayed(4, 60_000));
        requests.on_request(api_versions(5));

        assert!(requests.complete(
            4,
            Err(ProxyError::AnswerAbandoned { correlation_id: 4 })
        ));
        // Already answered or never queued
        assert!(!requests.complete(5, Err(ProxyError::Shutdown)));
        assert!(!requests.complete(6, Err(ProxyError::Shutdown)));

        let first = requests.pop_answered().unwrap();
        assert_eq!(first.state(), CommandState::Answered);
        assert!(matches!(
            first.compute_answer(),
            Err(ProxyError::AnswerFailed { correlation_id: 4, .. })
        ));
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (channel, rx) = AnswerChannel::new();
        drop(rx);

        channel.on_request_ready_for_answer(5);
    }
}
