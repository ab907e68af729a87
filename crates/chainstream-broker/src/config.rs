//! Publisher and consumer configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chainstream_core::StreamError;

/// Configuration for a [`StreamingProducer`](crate::StreamingProducer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// message type → schema name
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
    /// How long `publish` waits for an acknowledgement (milliseconds).
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    /// How often pending acknowledgements are polled (milliseconds).
    #[serde(default = "default_publisher_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on waiting for in-flight deliveries at shutdown (milliseconds).
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    /// Capacity of the lifecycle event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_delivery_timeout_ms() -> u64 { 30_000 }
fn default_publisher_poll_interval_ms() -> u64 { 50 }
fn default_flush_timeout_ms() -> u64 { 10_000 }
fn default_event_capacity() -> usize { 256 }

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            bindings: BTreeMap::new(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            poll_interval_ms: default_publisher_poll_interval_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl PublisherConfig {
    /// Bind `message_type` to `schema`.
    pub fn bind(mut self, message_type: impl Into<String>, schema: impl Into<String>) -> Self {
        self.bindings.insert(message_type.into(), schema.into());
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.delivery_timeout_ms == 0 {
            return Err(StreamError::configuration("delivery_timeout_ms must be positive"));
        }
        if self.poll_interval_ms == 0 {
            return Err(StreamError::configuration("poll_interval_ms must be positive"));
        }
        if self.event_capacity == 0 {
            return Err(StreamError::configuration("event_capacity must be positive"));
        }
        Ok(())
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// Configuration for a [`StreamingConsumer`](crate::StreamingConsumer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Topics to consume, served round-robin in this order.
    pub topics: Vec<String>,
    /// Per-topic starting offsets; override the broker's committed offset.
    #[serde(default)]
    pub start_offsets: BTreeMap<String, u64>,
    /// Fetched-but-undelivered messages held per topic, in-flight message included.
    #[serde(default = "default_max_buffered")]
    pub max_buffered: usize,
    /// Retries per message (decode or delivery) and per broker call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial retry backoff (milliseconds); doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Cap on the retry backoff (milliseconds).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Upper bound on a broker connection attempt (milliseconds).
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Idle wait between fetches when every buffer is empty (milliseconds).
    #[serde(default = "default_consumer_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// message type → schema name
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
}

fn default_max_buffered() -> usize { 100 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10_000 }
fn default_connection_timeout_ms() -> u64 { 10_000 }
fn default_consumer_poll_interval_ms() -> u64 { 100 }

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            start_offsets: BTreeMap::new(),
            max_buffered: default_max_buffered(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            poll_interval_ms: default_consumer_poll_interval_ms(),
            bindings: BTreeMap::new(),
        }
    }
}

impl ConsumerConfig {
    /// Consume `topics` with default settings.
    pub fn for_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Bind `message_type` to `schema`.
    pub fn bind(mut self, message_type: impl Into<String>, schema: impl Into<String>) -> Self {
        self.bindings.insert(message_type.into(), schema.into());
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.topics.is_empty() {
            return Err(StreamError::configuration("no topics configured"));
        }
        if self.max_buffered == 0 {
            return Err(StreamError::configuration("max_buffered must be positive"));
        }
        if self.poll_interval_ms == 0 {
            return Err(StreamError::configuration("poll_interval_ms must be positive"));
        }
        if self.connection_timeout_ms == 0 {
            return Err(StreamError::configuration("connection_timeout_ms must be positive"));
        }
        if let Some(topic) = self.start_offsets.keys().find(|t| !self.topics.contains(*t)) {
            return Err(StreamError::configuration(format!(
                "start offset given for unsubscribed topic '{topic}'"
            )));
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}
