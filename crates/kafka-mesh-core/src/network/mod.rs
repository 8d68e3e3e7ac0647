//! Network layer for the Kafka mesh proxy.
//!
//! This module provides:
//! - TCP listener for accepting client connections
//! - Kafka frame codec for parsing requests and encoding answers
//! - Per-connection in-flight queue and connection handler

pub mod codec;
pub mod connection;
pub mod in_flight;
pub mod listener;

pub use codec::{DecodedRequest, KafkaCodec, ResponseFrame};
pub use connection::ConnectionHandler;
pub use in_flight::{AnswerChannel, AnswerEvent, InFlightRequests};
pub use listener::ProxyListener;
