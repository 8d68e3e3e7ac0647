//! Test utilities for the Kafka mesh proxy.
//!
//! This module provides infrastructure for unit and integration testing:
//!
//! - [`mocks`] - `mockall` doubles for the upstream configuration and both
//!   listener seams
//! - [`DelayedCommand`] - A handler that answers from a spawned task
//! - [`TestClient`] - A minimal Kafka client over any async stream
//! - [`MeshTestHarness`] - A running proxy on an ephemeral port
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_mesh_core::testing::MeshTestHarness;
//!
//! #[tokio::test]
//! async fn test_api_versions() {
//!     let harness = MeshTestHarness::start().await;
//!     let mut client = harness.connect().await.unwrap();
//!
//!     client.send(18, 3, &ApiVersionsRequest::default()).await.unwrap();
//!     let (_, response) = client.receive::<ApiVersionsResponse>(3).await.unwrap();
//!     assert_eq!(response.error_code, 0);
//! }
//! ```

pub mod client;
pub mod delayed;
pub mod harness;
pub mod mocks;

pub use client::{encode_request, TestClient};
pub use delayed::{delayed_body, DelayedCommand};
pub use harness::{MeshTestHarness, TestHarnessBuilder};
