//! Metadata request handler.
//!
//! Presents the whole mesh as a single broker: the proxy itself, at its
//! advertised address. Every requested topic that a forwarding rule routes to
//! an upstream cluster is reported with that cluster's partition count, each
//! partition led by the proxy. Topics no rule matches come back with
//! `UNKNOWN_TOPIC_OR_PARTITION`.
//!
//! An absent or empty topic list yields the broker list and no topics:
//! forwarding rules are prefixes and patterns, so the set of topics behind the
//! mesh cannot be enumerated.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kafka_protocol::error::ResponseError;
use kafka_protocol::messages::metadata_response::{
    MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
};
use kafka_protocol::messages::{BrokerId, MetadataResponse, RequestHeader, TopicName};
use kafka_protocol::protocol::StrBytes;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::mesh::command::{AnswerListener, Command, CommandState, InFlightRequest, Lifecycle};
use crate::mesh::dispatch::{DispatchContext, SupportedVersions};
use crate::mesh::envelope::{RequestBody, RequestEnvelope};
use crate::network::codec::ResponseFrame;
use crate::upstream::UpstreamConfiguration;

use super::encode_answer;

/// Metadata versions this handler answers.
pub const METADATA_VERSIONS: SupportedVersions = SupportedVersions::new(0, 12);

/// Node ID the proxy reports for itself.
pub const PROXY_BROKER_ID: i32 = 0;

/// In-flight Metadata request.
pub struct MetadataCommand {
    lifecycle: Lifecycle,
    /// `None` when the request carried no topic list.
    requested_topics: Option<Vec<String>>,
    configuration: Arc<dyn UpstreamConfiguration>,
    response: Option<MetadataResponse>,
}

impl MetadataCommand {
    /// Create a command for `envelope` without inspecting its body.
    #[must_use]
    pub fn new(
        envelope: &RequestEnvelope,
        requested_topics: Option<Vec<String>>,
        configuration: Arc<dyn UpstreamConfiguration>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(envelope.header.clone()),
            requested_topics,
            configuration,
            response: None,
        }
    }

    /// Factory registered in the dispatch table.
    ///
    /// Returns `None` unless the envelope carries a Metadata body.
    pub fn create(envelope: &RequestEnvelope, context: &DispatchContext<'_>) -> Option<Command> {
        let RequestBody::Metadata(request) = &envelope.body else {
            return None;
        };

        // Topics addressed by ID only have no name to route on
        let requested_topics = request.topics.as_ref().map(|topics| {
            topics
                .iter()
                .filter_map(|topic| topic.name.as_ref().map(|name| name.to_string()))
                .collect()
        });

        Some(Command::Metadata(Self::new(
            envelope,
            requested_topics,
            Arc::clone(context.configuration),
        )))
    }

    /// Topic names requested by the client, `None` if the list was absent.
    #[must_use]
    pub fn requested_topics(&self) -> Option<&[String]> {
        self.requested_topics.as_deref()
    }

    /// The response, once answered.
    #[must_use]
    pub fn response(&self) -> Option<&MetadataResponse> {
        self.response.as_ref()
    }

    fn build_response(&self) -> MetadataResponse {
        let (host, port) = self.configuration.advertised_address();
        let api_version = self.lifecycle.header().request_api_version;

        let mut response = MetadataResponse::default();

        let mut broker = MetadataResponseBroker::default();
        broker.node_id = BrokerId(PROXY_BROKER_ID);
        broker.host = StrBytes::from_string(host);
        broker.port = port;
        response.brokers.push(broker);

        // controller_id is not part of v0
        if api_version >= 1 {
            response.controller_id = BrokerId(PROXY_BROKER_ID);
        }

        for topic in self.requested_topics.iter().flatten() {
            response.topics.push(self.describe_topic(topic));
        }

        response
    }

    fn describe_topic(&self, topic: &str) -> MetadataResponseTopic {
        let mut entry = MetadataResponseTopic::default();
        entry.name = Some(TopicName::from(StrBytes::from_string(topic.to_string())));

        let Some(cluster) = self.configuration.cluster_for_topic(topic) else {
            debug!(topic, "no upstream cluster for topic");
            entry.error_code = ResponseError::UnknownTopicOrPartition.code();
            return entry;
        };

        debug!(
            topic,
            cluster = %cluster.name,
            partitions = cluster.partition_count,
            "resolved topic"
        );

        entry.partitions = (0..cluster.partition_count)
            .map(|partition_index| {
                let mut partition = MetadataResponsePartition::default();
                partition.partition_index = partition_index;
                partition.leader_id = BrokerId(PROXY_BROKER_ID);
                partition.replica_nodes = vec![BrokerId(PROXY_BROKER_ID)];
                partition.isr_nodes = vec![BrokerId(PROXY_BROKER_ID)];
                partition
            })
            .collect();
        entry
    }
}

impl fmt::Debug for MetadataCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataCommand")
            .field("lifecycle", &self.lifecycle)
            .field("requested_topics", &self.requested_topics)
            .field("answered", &self.response.is_some())
            .finish_non_exhaustive()
    }
}

impl InFlightRequest for MetadataCommand {
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
        self.lifecycle.enter_processing();

        let response = self.build_response();
        debug!(
            correlation_id = self.correlation_id(),
            topics = response.topics.len(),
            "metadata answered"
        );
        self.response = Some(response);
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

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
    use kafka_protocol::messages::{ApiKey, ApiVersionsRequest, MetadataRequest};
    use kafka_protocol::protocol::Decodable;

    use super::*;
    use crate::config::ClusterConfig;
    use crate::mesh::dispatch::DispatchTable;
    use crate::mesh::envelope::request_header;
    use crate::testing::mocks::{MockNotifier, MockUpstream};

    fn cluster(name: &str, partition_count: i32) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            bootstrap_servers: vec![format!("{name}:9092")],
            partition_count,
        }
    }

    fn upstream() -> Arc<dyn UpstreamConfiguration> {
        let mut upstream = MockUpstream::new();
        upstream
            .expect_advertised_address()
            .return_const(("mesh.example.com".to_string(), 19092));
        upstream
            .expect_cluster_for_topic()
            .returning(|topic| match topic {
                "apples" => Some(cluster("fruit", 5)),
                "pears" => Some(cluster("fruit", 5)),
                "bananas" => Some(cluster("tropical", 2)),
                _ => None,
            });
        Arc::new(upstream)
    }

    fn metadata_envelope(api_version: i16, topics: Option<&[&str]>) -> RequestEnvelope {
        let mut request = MetadataRequest::default();
        request.topics = topics.map(|names| {
            names
                .iter()
                .map(|name| {
                    let mut topic = MetadataRequestTopic::default();
                    topic.name = Some(TopicName::from(StrBytes::from_string(name.to_string())));
                    topic
                })
                .collect()
        });
        RequestEnvelope::new(
            request_header(ApiKey::Metadata as i16, api_version, 11),
            RequestBody::Metadata(request),
        )
    }

    fn create(envelope: &RequestEnvelope) -> Option<Command> {
        let table = DispatchTable::standard();
        let configuration = upstream();
        let context = DispatchContext {
            table: &table,
            configuration: &configuration,
        };
        MetadataCommand::create(envelope, &context)
    }

    fn answered(api_version: i16, topics: Option<&[&str]>) -> MetadataCommand {
        let Some(Command::Metadata(mut command)) = create(&metadata_envelope(api_version, topics))
        else {
            panic!("expected a metadata command");
        };
        let mut notifier = MockNotifier::new();
        notifier
            .expect_on_request_ready_for_answer()
            .times(1)
            .return_const(());
        command.start_processing(Arc::new(notifier));
        command
    }

    #[test]
    fn test_create_rejects_other_bodies() {
        let envelope = RequestEnvelope::new(
            request_header(ApiKey::Metadata as i16, 1, 1),
            RequestBody::ApiVersions(ApiVersionsRequest::default()),
        );
        assert!(create(&envelope).is_none());

        let opaque = RequestEnvelope::new(
            request_header(ApiKey::Metadata as i16, 1, 1),
            RequestBody::Opaque(Bytes::new()),
        );
        assert!(create(&opaque).is_none());
    }

    #[test]
    fn test_create_copies_topic_names() {
        let Some(Command::Metadata(command)) =
            create(&metadata_envelope(4, Some(&["apples", "bananas"])))
        else {
            panic!("expected a metadata command");
        };

        assert_eq!(command.state(), CommandState::Created);
        assert_eq!(
            command.requested_topics(),
            Some(&["apples".to_string(), "bananas".to_string()][..])
        );
        assert!(command.response().is_none());
    }

    #[test]
    fn test_broker_is_advertised_address() {
        let command = answered(1, Some(&[]));
        let response = command.response().unwrap();

        assert_eq!(response.brokers.len(), 1);
        assert_eq!(response.brokers[0].node_id, BrokerId(PROXY_BROKER_ID));
        assert_eq!(response.brokers[0].host.to_string(), "mesh.example.com");
        assert_eq!(response.brokers[0].port, 19092);
        assert_eq!(response.controller_id, BrokerId(PROXY_BROKER_ID));
    }

    #[test]
    fn test_resolved_topics_get_cluster_partitions() {
        let command = answered(9, Some(&["apples", "bananas"]));
        let response = command.response().unwrap();

        assert_eq!(response.topics.len(), 2);

        let apples = &response.topics[0];
        assert_eq!(apples.name.as_ref().unwrap().to_string(), "apples");
        assert_eq!(apples.error_code, 0);
        assert_eq!(apples.partitions.len(), 5);
        for (index, partition) in apples.partitions.iter().enumerate() {
            assert_eq!(partition.partition_index, index as i32);
            assert_eq!(partition.leader_id, BrokerId(PROXY_BROKER_ID));
            assert_eq!(partition.replica_nodes, vec![BrokerId(PROXY_BROKER_ID)]);
            assert_eq!(partition.isr_nodes, vec![BrokerId(PROXY_BROKER_ID)]);
        }

        assert_eq!(response.topics[1].partitions.len(), 2);
    }

    #[test]
    fn test_unknown_topic_gets_error_entry() {
        let command = answered(9, Some(&["apples", "cherries"]));
        let response = command.response().unwrap();

        assert_eq!(command.state(), CommandState::Answered);
        assert_eq!(response.topics.len(), 2);

        let cherries = &response.topics[1];
        assert_eq!(cherries.name.as_ref().unwrap().to_string(), "cherries");
        assert_eq!(
            cherries.error_code,
            ResponseError::UnknownTopicOrPartition.code()
        );
        assert!(cherries.partitions.is_empty());
    }

    #[test]
    fn test_absent_topic_list_returns_no_topics() {
        let command = answered(4, None);
        let response = command.response().unwrap();

        assert_eq!(response.brokers.len(), 1);
        assert!(response.topics.is_empty());
    }

    #[test]
    fn test_v0_omits_controller() {
        let command = answered(0, Some(&["pears"]));
        let response = command.response().unwrap();

        assert_eq!(response.controller_id, MetadataResponse::default().controller_id);
        assert!(command.compute_answer().is_ok());
    }

    #[test]
    fn test_compute_answer_before_processing() {
        let Some(command) = create(&metadata_envelope(1, Some(&["apples"]))) else {
            panic!("expected a command");
        };

        assert!(matches!(
            command.compute_answer(),
            Err(ProxyError::AnswerNotReady { correlation_id: 11 })
        ));
    }

    #[test]
    fn test_compute_answer_round_trips() {
        let command = answered(12, Some(&["bananas"]));
        let frame = command.compute_answer().unwrap();

        assert_eq!(frame.correlation_id, 11);
        let mut body = frame.body.freeze();
        let decoded = MetadataResponse::decode(&mut body, 12).unwrap();
        assert_eq!(decoded.topics.len(), 1);
        assert_eq!(decoded.topics[0].partitions.len(), 2);
        assert_eq!(decoded.brokers[0].host.to_string(), "mesh.example.com");
    }

    #[test]
    fn test_start_processing_twice_notifies_once() {
        let mut command = answered(1, Some(&["apples"]));

        let mut notifier = MockNotifier::new();
        notifier.expect_on_request_ready_for_answer().never();
        command.start_processing(Arc::new(notifier));

        assert_eq!(command.state(), CommandState::Answered);
    }
}
