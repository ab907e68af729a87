//! chainstream-producer: reorg-safe block producer.
//!
//! Discovers new blocks by polling or push subscription, holds them back
//! until they trail the head by the confirmation delay, verifies every
//! parent-hash link, and resolves forks up to a configured depth. The output
//! is an ordered stream of [`ChainEvent`](chainstream_core::ChainEvent)s.

pub mod builder;
pub mod config;
pub mod producer;
pub mod reorg;
pub mod window;

pub use builder::ProducerBuilder;
pub use config::{DiscoveryMode, ProducerConfig};
pub use producer::{BlockProducer, ProducerHandle, ProducerMetrics, ProducerState};
pub use reorg::{find_common_ancestor, Resolution};
pub use window::ReorgWindow;
