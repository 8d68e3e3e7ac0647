//! Request dispatch core.
//!
//! Decoded requests enter through [`RequestProcessor`], are matched against
//! the [`DispatchTable`], and leave as a [`Command`] owned by a
//! [`RequestListener`]. Commands signal readiness through an
//! [`AnswerListener`] so answers can be written back in arrival order.

pub mod command;
pub mod dispatch;
pub mod envelope;
pub mod processor;

pub use command::{
    AnswerListener, Command, CommandKind, CommandState, InFlightRequest, Lifecycle,
    PendingAnswer, RequestListener,
};
pub use dispatch::{
    CommandFactory, DispatchContext, DispatchEntry, DispatchTable, DispatchTableBuilder,
    SupportedVersions,
};
pub use envelope::{request_header, RequestBody, RequestEnvelope, RequestParseFailure};
pub use processor::RequestProcessor;
