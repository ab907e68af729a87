//! chainstream-broker: broker-backed streaming pipeline.
//!
//! - [`StreamingProducer`] encodes messages through the coder registry and
//!   resolves each publish on the broker's delivery report.
//! - [`StreamingConsumer`] keeps a bounded buffer per topic and hands
//!   decoded messages to an [`Observer`](chainstream_core::Observer) one at
//!   a time; a full buffer pauses fetching.
//! - [`BlockPublisher`] plugs a block producer's output into a publisher.
//!
//! Broker access goes through [`BrokerProducerClient`] and
//! [`BrokerConsumerClient`]; [`MemoryBroker`] implements both in-process.

pub mod bridge;
pub mod client;
pub mod config;
pub mod consumer;
pub mod memory;
pub mod producer;

pub use bridge::{BlockPublisher, BLOCK_MESSAGE_TYPE, REORG_MESSAGE_TYPE};
pub use client::{
    BrokerConsumerClient, BrokerProducerClient, BrokerRecord, DeliveryReport, DeliveryStatus,
    ProducerRecord, MESSAGE_TYPE_HEADER, SCHEMA_HEADER,
};
pub use config::{ConsumerConfig, PublisherConfig};
pub use consumer::{ConsumedMessage, ConsumerHandle, ConsumerMetrics, StreamingConsumer};
pub use memory::{AckMode, MemoryBroker};
pub use producer::{ProducerEvent, Publish, PublisherMetrics, StreamingProducer};
