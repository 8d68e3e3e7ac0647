//! Request processor: the single entry point from the decoder into the mesh.
//!
//! Turns each decoded envelope into a command handed to the listener, or into
//! a typed error for the caller. The processor runs synchronously on the
//! connection task, one envelope at a time, so commands reach the listener in
//! the order their envelopes were decoded.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::upstream::UpstreamConfiguration;

use super::command::RequestListener;
use super::dispatch::{DispatchContext, DispatchTable};
use super::envelope::{RequestEnvelope, RequestParseFailure};

/// Dispatches decoded requests to command factories.
pub struct RequestProcessor<L> {
    listener: L,
    configuration: Arc<dyn UpstreamConfiguration>,
    table: Arc<DispatchTable>,
}

impl<L: RequestListener> RequestProcessor<L> {
    /// Create a processor feeding `listener`.
    pub fn new(
        listener: L,
        configuration: Arc<dyn UpstreamConfiguration>,
        table: Arc<DispatchTable>,
    ) -> Self {
        Self {
            listener,
            configuration,
            table,
        }
    }

    /// Dispatch a decoded request.
    ///
    /// On success exactly one command has been handed to the listener.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::UnsupportedRequest`] if no handler serves the API key
    ///   at this version.
    /// - [`ProxyError::UnknownRequest`] if the handler cannot be built from
    ///   the envelope body.
    ///
    /// The listener is not notified in either case.
    pub fn on_message(&mut self, envelope: Arc<RequestEnvelope>) -> Result<()> {
        let api_key = envelope.api_key();
        let api_version = envelope.api_version();
        let correlation_id = envelope.correlation_id();

        let Some(entry) = self.table.lookup(api_key, api_version) else {
            debug!(
                api_key,
                api_version,
                correlation_id,
                "no handler for request"
            );
            return Err(ProxyError::UnsupportedRequest {
                api_key,
                api_version,
            });
        };

        let context = DispatchContext {
            table: &self.table,
            configuration: &self.configuration,
        };
        let Some(command) = entry.create(&envelope, &context) else {
            warn!(
                api_key,
                api_version,
                correlation_id,
                "request body does not match its API key"
            );
            return Err(ProxyError::UnknownRequest {
                api_key,
                api_version,
            });
        };

        debug!(
            kind = ?command.kind(),
            api_version,
            correlation_id,
            "dispatching request"
        );
        self.listener.on_request(command);
        Ok(())
    }

    /// Report a request that could not be decoded.
    ///
    /// # Errors
    ///
    /// Always returns [`ProxyError::UnknownRequest`] carrying the header's
    /// API key and version. Nothing is dispatched.
    pub fn on_failed_parse(&mut self, failure: &RequestParseFailure) -> Result<()> {
        warn!(
            api_key = failure.api_key(),
            api_version = failure.api_version(),
            correlation_id = failure.header.correlation_id,
            reason = %failure.reason,
            "request could not be decoded"
        );
        Err(ProxyError::UnknownRequest {
            api_key: failure.api_key(),
            api_version: failure.api_version(),
        })
    }

    /// The listener commands are handed to.
    pub fn listener(&self) -> &L {
        &self.listener
    }

    /// Mutable access to the listener, for draining answered commands.
    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    /// The dispatch table in use.
    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }
}
