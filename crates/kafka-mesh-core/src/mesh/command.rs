//! In-flight request lifecycle.
//!
//! Every dispatched request is represented by a [`Command`] until it has been
//! answered. A command moves through
//!
//! ```text
//! Created -> Processing -> Answered
//! ```
//!
//! and notifies an [`AnswerListener`] exactly once, when it reaches
//! `Answered`. Handlers that can answer from local state go straight from
//! `Created` to `Answered`.
//!
//! Processing is started by whoever owns the command (the per-connection
//! request queue), never by the request processor, so dispatch itself never
//! waits on upstream work.
//!
//! A handler that has to wait calls [`Lifecycle::defer`] and moves the
//! returned [`PendingAnswer`] into a spawned task. The task cannot touch the
//! command, which stays owned by the queue; it hands its result to the
//! [`AnswerListener`] instead, and the owner applies it with
//! [`InFlightRequest::complete`], matching on correlation ID.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kafka_protocol::messages::RequestHeader;
use tracing::{trace, warn};

use crate::error::{ProxyError, Result};
use crate::handlers::{ApiVersionsCommand, MetadataCommand};
use crate::network::codec::ResponseFrame;

/// Lifecycle state of an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Built from the envelope, processing not started.
    Created,
    /// Waiting on something before an answer can be built.
    Processing,
    /// Answer available. Terminal.
    Answered,
}

/// Receives readiness notifications from commands.
///
/// Commands refer back to their request by correlation ID only, never by
/// pointer.
pub trait AnswerListener: Send + Sync {
    /// Called once when the command for `correlation_id` reaches `Answered`.
    fn on_request_ready_for_answer(&self, correlation_id: i32);

    /// Called once, usually from another task, when a deferred command has
    /// its answer. The command's owner must pass `answer` to
    /// [`InFlightRequest::complete`].
    fn on_answer_computed(&self, correlation_id: i32, answer: Result<ResponseFrame>);
}

/// Receives commands from the request processor.
pub trait RequestListener {
    /// Called exactly once per dispatched envelope, in arrival order.
    /// Ownership of `command` passes to the listener.
    fn on_request(&mut self, command: Command);
}

/// Contract implemented by every request handler.
pub trait InFlightRequest {
    /// Header of the originating request.
    fn header(&self) -> &RequestHeader;

    /// Current lifecycle state.
    fn state(&self) -> CommandState;

    /// Begin working towards an answer.
    ///
    /// Has no effect if processing was already started.
    fn start_processing(&mut self, listener: Arc<dyn AnswerListener>);

    /// Encode the answer.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::AnswerNotReady`] before the command is answered,
    /// [`ProxyError::AnswerFailed`] if deferred work failed, or an encode
    /// error.
    fn compute_answer(&self) -> Result<ResponseFrame>;

    /// Apply an answer delivered through [`AnswerListener::on_answer_computed`].
    ///
    /// Ignored unless the command is waiting on a deferred answer.
    fn complete(&mut self, answer: Result<ResponseFrame>);

    /// Time since the command was created.
    fn elapsed(&self) -> Duration;

    /// Correlation ID the answer must carry.
    fn correlation_id(&self) -> i32 {
        self.header().correlation_id
    }

    /// Whether the answer can be flushed.
    fn finished(&self) -> bool {
        self.state() == CommandState::Answered
    }
}

/// State shared by all handlers: the originating header and lifecycle state.
#[derive(Debug)]
pub struct Lifecycle {
    header: RequestHeader,
    state: CommandState,
    created_at: Instant,
    /// Answer delivered to a deferred command.
    deferred: Option<Result<ResponseFrame>>,
}

impl Lifecycle {
    /// Start a lifecycle in `Created`.
    #[must_use]
    pub fn new(header: RequestHeader) -> Self {
        Self {
            header,
            state: CommandState::Created,
            created_at: Instant::now(),
            deferred: None,
        }
    }

    /// Originating header.
    #[must_use]
    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Time since the command was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Check that processing may start. Returns `false` if it already has.
    pub fn can_start(&self) -> bool {
        if self.state == CommandState::Created {
            return true;
        }
        warn!(
            correlation_id = self.header.correlation_id,
            state = ?self.state,
            "ignoring repeated start of in-flight request"
        );
        false
    }

    /// Move to `Processing`.
    pub fn enter_processing(&mut self) {
        self.state = CommandState::Processing;
    }

    /// Move to `Answered` and notify `listener`.
    pub fn answer(&mut self, listener: &dyn AnswerListener) {
        debug_assert_ne!(self.state, CommandState::Answered, "request answered twice");
        self.mark_answered();
        listener.on_request_ready_for_answer(self.header.correlation_id);
    }

    /// Move to `Processing` and hand out the handle that will carry the
    /// answer back.
    #[must_use]
    pub fn defer(&mut self, listener: Arc<dyn AnswerListener>) -> PendingAnswer {
        self.enter_processing();
        PendingAnswer {
            correlation_id: self.header.correlation_id,
            listener,
            delivered: false,
        }
    }

    /// Store a deferred answer and move to `Answered`.
    ///
    /// Ignored, with a warning, unless the command is `Processing`.
    pub fn settle(&mut self, answer: Result<ResponseFrame>) {
        if self.state != CommandState::Processing {
            warn!(
                correlation_id = self.header.correlation_id,
                state = ?self.state,
                "ignoring answer for request that is not waiting on one"
            );
            return;
        }
        self.deferred = Some(answer);
        self.mark_answered();
    }

    /// The answer stored by [`settle`](Self::settle).
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::AnswerNotReady`] if nothing was settled yet, or
    /// [`ProxyError::AnswerFailed`] if the deferred work failed.
    pub fn deferred_answer(&self) -> Result<ResponseFrame> {
        let correlation_id = self.header.correlation_id;
        match &self.deferred {
            Some(Ok(frame)) => Ok(frame.clone()),
            Some(Err(e)) => Err(ProxyError::AnswerFailed {
                correlation_id,
                reason: e.to_string(),
            }),
            None => Err(ProxyError::AnswerNotReady { correlation_id }),
        }
    }

    fn mark_answered(&mut self) {
        self.state = CommandState::Answered;
        trace!(
            correlation_id = self.header.correlation_id,
            elapsed_us = self.elapsed().as_micros() as u64,
            "request answered"
        );
    }
}

/// Handle a deferred command uses to deliver its answer from another task.
///
/// Dropping it without calling [`complete`](Self::complete) delivers
/// [`ProxyError::AnswerAbandoned`], so the connection never waits forever on
/// a lost task.
pub struct PendingAnswer {
    correlation_id: i32,
    listener: Arc<dyn AnswerListener>,
    delivered: bool,
}

impl PendingAnswer {
    /// Correlation ID of the waiting request.
    #[must_use]
    pub fn correlation_id(&self) -> i32 {
        self.correlation_id
    }

    /// Deliver the answer.
    pub fn complete(mut self, answer: Result<ResponseFrame>) {
        self.delivered = true;
        self.listener.on_answer_computed(self.correlation_id, answer);
    }
}

impl Drop for PendingAnswer {
    fn drop(&mut self) {
        if self.delivered {
            return;
        }
        warn!(correlation_id = self.correlation_id, "deferred answer abandoned");
        self.listener.on_answer_computed(
            self.correlation_id,
            Err(ProxyError::AnswerAbandoned {
                correlation_id: self.correlation_id,
            }),
        );
    }
}

impl fmt::Debug for PendingAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAnswer")
            .field("correlation_id", &self.correlation_id)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

/// Kind of a command. One per registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// [`MetadataCommand`].
    Metadata,
    /// [`ApiVersionsCommand`].
    ApiVersions,
    /// A handler registered from outside this crate.
    Custom,
}

/// An in-flight request, one variant per handler.
pub enum Command {
    /// Metadata request.
    Metadata(MetadataCommand),
    /// ApiVersions request.
    ApiVersions(ApiVersionsCommand),
    /// Request served by a handler this crate does not ship.
    Custom(Box<dyn InFlightRequest + Send>),
}

impl Command {
    /// Which handler produced this command.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Metadata(_) => CommandKind::Metadata,
            Self::ApiVersions(_) => CommandKind::ApiVersions,
            Self::Custom(_) => CommandKind::Custom,
        }
    }

    /// API key of the originating request.
    #[must_use]
    pub fn api_key(&self) -> i16 {
        self.header().request_api_key
    }

    fn request(&self) -> &dyn InFlightRequest {
        match self {
            Self::Metadata(command) => command,
            Self::ApiVersions(command) => command,
            Self::Custom(command) => command.as_ref(),
        }
    }

    fn request_mut(&mut self) -> &mut dyn InFlightRequest {
        match self {
            Self::Metadata(command) => command,
            Self::ApiVersions(command) => command,
            Self::Custom(command) => command.as_mut(),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata(command) => f.debug_tuple("Metadata").field(command).finish(),
            Self::ApiVersions(command) => f.debug_tuple("ApiVersions").field(command).finish(),
            Self::Custom(command) => f
                .debug_struct("Custom")
                .field("correlation_id", &command.correlation_id())
                .field("state", &command.state())
                .finish(),
        }
    }
}

impl InFlightRequest for Command {
    fn header(&self) -> &RequestHeader {
        self.request().header()
    }

    fn state(&self) -> CommandState {
        self.request().state()
    }

    fn start_processing(&mut self, listener: Arc<dyn AnswerListener>) {
        self.request_mut().start_processing(listener);
    }

    fn compute_answer(&self) -> Result<ResponseFrame> {
        self.request().compute_answer()
    }

    fn complete(&mut self, answer: Result<ResponseFrame>) {
        self.request_mut().complete(answer);
    }

    fn elapsed(&self) -> Duration {
        self.request().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::BytesMut;

    use super::*;
    use crate::mesh::envelope::request_header;
    use crate::testing::mocks::MockNotifier;

    #[test]
    fn test_lifecycle_starts_created() {
        let lifecycle = Lifecycle::new(request_header(18, 0, 5));

        assert_eq!(lifecycle.state(), CommandState::Created);
        assert_eq!(lifecycle.header().correlation_id, 5);
        assert!(lifecycle.can_start());
    }

    #[test]
    fn test_lifecycle_answer_notifies_with_correlation_id() {
        let mut lifecycle = Lifecycle::new(request_header(3, 1, 99));
        let mut notifier = MockNotifier::new();
        notifier
            .expect_on_request_ready_for_answer()
            .withf(|correlation_id| *correlation_id == 99)
            .times(1)
            .return_const(());

        lifecycle.enter_processing();
        assert_eq!(lifecycle.state(), CommandState::Processing);

        lifecycle.answer(&notifier);
        assert_eq!(lifecycle.state(), CommandState::Answered);
    }

    #[test]
    fn test_lifecycle_cannot_restart() {
        let mut lifecycle = Lifecycle::new(request_header(3, 1, 1));
        lifecycle.enter_processing();
        assert!(!lifecycle.can_start());
    }

    fn frame(correlation_id: i32) -> ResponseFrame {
        ResponseFrame {
            correlation_id,
            header_version: 0,
            body: BytesMut::from(&b"answer"[..]),
        }
    }

    #[test]
    fn test_deferred_answer_settles_lifecycle() {
        let mut lifecycle = Lifecycle::new(request_header(3, 1, 7));
        let delivered = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&delivered);
        let mut notifier = MockNotifier::new();
        notifier.expect_on_request_ready_for_answer().never();
        notifier
            .expect_on_answer_computed()
            .times(1)
            .returning(move |id, answer| *sink.lock().unwrap() = Some((id, answer)));

        let pending = lifecycle.defer(Arc::new(notifier));
        assert_eq!(pending.correlation_id(), 7);
        assert_eq!(lifecycle.state(), CommandState::Processing);
        assert!(matches!(
            lifecycle.deferred_answer(),
            Err(ProxyError::AnswerNotReady { correlation_id: 7 })
        ));

        // As if from the task that did the work
        pending.complete(Ok(frame(7)));
        let (id, answer) = delivered.lock().unwrap().take().unwrap();
        assert_eq!(id, 7);

        lifecycle.settle(answer);
        assert_eq!(lifecycle.state(), CommandState::Answered);
        assert_eq!(&lifecycle.deferred_answer().unwrap().body[..], b"answer");
    }

    #[test]
    fn test_dropped_pending_answer_is_abandoned() {
        let mut lifecycle = Lifecycle::new(request_header(3, 1, 8));
        let mut notifier = MockNotifier::new();
        notifier
            .expect_on_answer_computed()
            .withf(|id, answer| {
                *id == 8 && matches!(answer, Err(ProxyError::AnswerAbandoned { correlation_id: 8 }))
            })
            .times(1)
            .return_const(());

        drop(lifecycle.defer(Arc::new(notifier)));

        lifecycle.settle(Err(ProxyError::AnswerAbandoned { correlation_id: 8 }));
        assert_eq!(lifecycle.state(), CommandState::Answered);
        assert!(matches!(
            lifecycle.deferred_answer(),
            Err(ProxyError::AnswerFailed { correlation_id: 8, .. })
        ));
    }

    #[test]
    fn test_settle_ignored_unless_processing() {
        let mut lifecycle = Lifecycle::new(request_header(3, 1, 9));

        lifecycle.settle(Ok(frame(9)));

        assert_eq!(lifecycle.state(), CommandState::Created);
        assert!(lifecycle.deferred_answer().is_err());
    }
}
