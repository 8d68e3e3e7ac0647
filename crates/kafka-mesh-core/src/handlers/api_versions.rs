//! ApiVersions request handler.
//!
//! Answers locally with the API keys and version ranges registered in the
//! dispatch table, so clients only negotiate what the proxy can serve.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kafka_protocol::messages::api_versions_response::ApiVersion;
use kafka_protocol::messages::{ApiVersionsResponse, RequestHeader};
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::mesh::command::{AnswerListener, Command, CommandState, InFlightRequest, Lifecycle};
use crate::mesh::dispatch::{DispatchContext, SupportedVersions};
use crate::mesh::envelope::{RequestBody, RequestEnvelope};
use crate::network::codec::ResponseFrame;

use super::encode_answer;

/// ApiVersions versions this handler answers.
pub const API_VERSIONS_VERSIONS: SupportedVersions = SupportedVersions::new(0, 3);

/// In-flight ApiVersions request.
pub struct ApiVersionsCommand {
    lifecycle: Lifecycle,
    supported: Vec<(i16, SupportedVersions)>,
    response: Option<ApiVersionsResponse>,
}

impl ApiVersionsCommand {
    /// Create a command advertising `supported`.
    #[must_use]
    pub fn new(envelope: &RequestEnvelope, supported: Vec<(i16, SupportedVersions)>) -> Self {
        Self {
            lifecycle: Lifecycle::new(envelope.header.clone()),
            supported,
            response: None,
        }
    }

    /// Factory registered in the dispatch table.
    pub fn create(envelope: &RequestEnvelope, context: &DispatchContext<'_>) -> Option<Command> {
        let RequestBody::ApiVersions(_) = &envelope.body else {
            return None;
        };
        Some(Command::ApiVersions(Self::new(
            envelope,
            context.table.supported_apis().collect(),
        )))
    }

    /// The response, once answered.
    #[must_use]
    pub fn response(&self) -> Option<&ApiVersionsResponse> {
        self.response.as_ref()
    }

    fn build_response(&self) -> ApiVersionsResponse {
        let mut response = ApiVersionsResponse::default();
        response.error_code = 0;

        for &(api_key, versions) in &self.supported {
            let mut api = ApiVersion::default();
            api.api_key = api_key;
            api.min_version = versions.min;
            api.max_version = versions.max;
            response.api_keys.push(api);
        }

        response
    }
}

impl fmt::Debug for ApiVersionsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiVersionsCommand")
            .field("lifecycle", &self.lifecycle)
            .field("supported", &self.supported)
            .field("answered", &self.response.is_some())
            .finish()
    }
}

impl InFlightRequest for ApiVersionsCommand {
    fn header(&self) -> &RequestHeader {
        self.lifecycle.header()
    }

    fn state(&self) -> CommandState {
        self.lifecycle.state()
    }

    // Answered from local state: no Processing phase.
    fn start_processing(&mut self, listener: Arc<dyn AnswerListener>) {
        if !self.lifecycle.can_start() {
            return;
        }
        debug!(
            correlation_id = self.correlation_id(),
            api_keys = self.supported.len(),
            "handling ApiVersions"
        );
        self.response = Some(self.build_response());
        self.lifecycle.answer(listener.as_ref());
    }

    fn compute_answer(&self) -> Result<ResponseFrame> {
        let response = self.response.as_ref().ok_or(ProxyError::AnswerNotReady {
            correlation_id: self.correlation_id(),
        })?;
        encode_answer(self.lifecycle.header(), response)
    }

    fn complete(&mut self, answer: Result<ResponseFrame>) {
        self.lifecycle.settle(answer);
    }

    fn elapsed(&self) -> Duration {
        self.lifecycle.elapsed()
    }
}
