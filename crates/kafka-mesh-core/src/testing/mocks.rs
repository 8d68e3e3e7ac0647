//! `mockall` doubles for the seams of the dispatch core.

use mockall::mock;

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::mesh::{AnswerListener, Command, RequestListener};
use crate::network::codec::ResponseFrame;
use crate::upstream::UpstreamConfiguration;

mock! {
    // Upstream topology double.
    pub Upstream {}
    impl UpstreamConfiguration for Upstream {
        fn cluster_for_topic(&self, topic: &str) -> Option<ClusterConfig>;
        fn advertised_address(&self) -> (String, i32);
    }
}

mock! {
    // Records commands handed over by the processor.
    pub Listener {}
    impl RequestListener for Listener {
        fn on_request(&mut self, command: Command);
    }
}

mock! {
    // Records readiness notifications.
    pub Notifier {}
    impl AnswerListener for Notifier {
        fn on_request_ready_for_answer(&self, correlation_id: i32);
        fn on_answer_computed(&self, correlation_id: i32, answer: Result<ResponseFrame>);
    }
}
