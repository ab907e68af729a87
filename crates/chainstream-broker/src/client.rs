//! The contract this crate requires from a message-broker client.
//!
//! Wire-protocol details stay behind these two traits. A broker adapter
//! implements them; [`MemoryBroker`](crate::MemoryBroker) is the in-process one.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chainstream_core::StreamError;

/// Header carrying the declared message type of a record.
pub const MESSAGE_TYPE_HEADER: &str = "message-type";
/// Header carrying the schema name the payload was encoded with.
pub const SCHEMA_HEADER: &str = "schema";

// ─── Records ──────────────────────────────────────────────────────────────────

/// A record handed to the broker by the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    /// Assigned by the publisher before the record is sent; echoed back in
    /// the matching [`DeliveryReport`].
    pub delivery_id: u64,
    pub topic: String,
    pub key: Option<String>,
    pub payload: Bytes,
    pub partition: Option<u32>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: BTreeMap<String, String>,
}

/// A record as stored by the broker and returned by a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
    pub headers: BTreeMap<String, String>,
}

impl BrokerRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Outcome of one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Acknowledged { partition: u32, offset: u64 },
    Rejected { reason: String },
}

/// Broker acknowledgement (or rejection) of a published record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub delivery_id: u64,
    pub topic: String,
    #[serde(flatten)]
    pub status: DeliveryStatus,
}

impl DeliveryReport {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self.status, DeliveryStatus::Acknowledged { .. })
    }
}

// ─── Client traits ────────────────────────────────────────────────────────────

/// Publishing side of a broker connection.
#[async_trait]
pub trait BrokerProducerClient: Send + Sync {
    async fn connect(&self) -> Result<(), StreamError>;

    /// Queue a record. Success means the broker accepted the hand-off, not
    /// that the record is durable; that arrives later as a [`DeliveryReport`].
    async fn send(&self, record: ProducerRecord) -> Result<(), StreamError>;

    /// Drain the delivery reports observed since the previous call.
    async fn poll_deliveries(&self) -> Result<Vec<DeliveryReport>, StreamError>;

    /// Records sent but not yet reported on.
    fn pending_count(&self) -> usize;
}

/// Consuming side of a broker connection.
#[async_trait]
pub trait BrokerConsumerClient: Send + Sync {
    async fn connect(&self) -> Result<(), StreamError>;

    /// The next offset to read for `topic`, if one was ever committed.
    async fn committed_offset(&self, topic: &str) -> Result<Option<u64>, StreamError>;

    /// Up to `max` records of `topic` starting at offset `from`.
    async fn fetch(&self, topic: &str, from: u64, max: usize) -> Result<Vec<BrokerRecord>, StreamError>;

    /// Record `offset` as the next offset to read for `topic`.
    async fn commit(&self, topic: &str, offset: u64) -> Result<(), StreamError>;
}
