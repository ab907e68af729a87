//! `StreamingConsumer`: bounded per-topic buffers in front of a sequenced observer.
//!
//! # Flow control
//! Each topic holds at most `max_buffered` fetched-but-undelivered records,
//! and the record being handed to the observer still counts against its
//! topic until `next` settles. A full topic is not fetched from. Since the
//! control loop awaits `next` before doing anything else, one slow observer
//! call holds the whole instance.
//!
//! # Failures
//! Decode and delivery failures are retried with backoff up to
//! `max_retries`; after that the observer sees `error` then `closed`, and
//! the consumer halts. Broker failures (connect, fetch) follow the same
//! budget.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use chainstream_core::{CoderRegistry, ErrorKind, Lifecycle, Observer, ResolvedCoders, StreamError};

use crate::client::{BrokerConsumerClient, BrokerRecord, MESSAGE_TYPE_HEADER, SCHEMA_HEADER};
use crate::config::ConsumerConfig;

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A decoded record handed to the observer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub message_type: String,
    pub value: Value,
}

impl ConsumedMessage {
    /// Deserialize the decoded value into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StreamError> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// Counters for one consumer instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerMetrics {
    pub fetched: u64,
    pub delivered: u64,
    pub retries: u64,
    /// Times a topic's buffer filled up and fetching from it paused.
    pub pauses: u64,
}

// ─── Shared state ─────────────────────────────────────────────────────────────

struct Shared {
    lifecycle: Lifecycle,
    observer: Arc<dyn Observer<ConsumedMessage>>,
    metrics: Mutex<ConsumerMetrics>,
    buffered: Mutex<HashMap<String, usize>>,
    closed: AtomicBool,
    halted: watch::Sender<bool>,
}

impl Shared {
    async fn close(&self, error: Option<&StreamError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(e) = error {
            self.observer.error(e).await;
        }
        self.observer.closed().await;
        self.halted.send_replace(true);
        tracing::info!("streaming consumer stopped");
    }
}

/// Control handle for a running consumer.
#[derive(Clone)]
pub struct ConsumerHandle {
    shared: Arc<Shared>,
}

impl ConsumerHandle {
    /// Stop the consumer. Once this returns, `next` is not called again.
    ///
    /// Waits for an in-flight `next` to settle; from inside `next` use
    /// [`ConsumerHandle::request_stop`].
    pub async fn stop(&self) {
        self.shared
            .lifecycle
            .stop_with(self.shared.close(None))
            .await;
    }

    pub fn request_stop(&self) {
        self.shared.lifecycle.request_stop();
    }

    /// Resolves once the consumer has halted and `closed` was delivered.
    pub async fn stopped(&self) {
        let mut rx = self.shared.halted.subscribe();
        let _ = rx.wait_for(|halted| *halted).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.halted.borrow()
    }

    /// Records held for `topic`, including the one being delivered.
    pub fn buffered(&self, topic: &str) -> usize {
        self.shared.buffered.lock().unwrap().get(topic).copied().unwrap_or(0)
    }

    pub fn metrics(&self) -> ConsumerMetrics {
        self.shared.metrics.lock().unwrap().clone()
    }
}

// ─── Consumer ─────────────────────────────────────────────────────────────────

/// Consumes broker topics and delivers decoded messages one at a time.
pub struct StreamingConsumer {
    config: ConsumerConfig,
    client: Arc<dyn BrokerConsumerClient>,
    coders: ResolvedCoders,
}

impl StreamingConsumer {
    /// Validate the config and resolve its coder bindings.
    pub fn new(
        config: ConsumerConfig,
        client: Arc<dyn BrokerConsumerClient>,
        registry: &CoderRegistry,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let coders = registry.resolve(&config.bindings)?;
        Ok(Self { config, client, coders })
    }

    /// Spawn the control loop.
    pub fn start(self, observer: Arc<dyn Observer<ConsumedMessage>>) -> ConsumerHandle {
        let (halted, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            lifecycle: Lifecycle::new(),
            observer,
            metrics: Mutex::new(ConsumerMetrics::default()),
            buffered: Mutex::new(self.config.topics.iter().map(|t| (t.clone(), 0)).collect()),
            closed: AtomicBool::new(false),
            halted,
        });
        let control = ControlLoop {
            topics: Vec::new(),
            round_robin: 0,
            config: self.config,
            client: self.client,
            coders: self.coders,
            shared: Arc::clone(&shared),
        };
        tokio::spawn(control.run());
        ConsumerHandle { shared }
    }
}

/// Per-topic state, owned by the control loop.
struct TopicState {
    name: String,
    buffer: VecDeque<BrokerRecord>,
    next_offset: u64,
    in_flight: bool,
    paused: bool,
}

impl TopicState {
    fn held(&self) -> usize {
        self.buffer.len() + usize::from(self.in_flight)
    }
}

struct ControlLoop {
    config: ConsumerConfig,
    client: Arc<dyn BrokerConsumerClient>,
    coders: ResolvedCoders,
    shared: Arc<Shared>,
    topics: Vec<TopicState>,
    round_robin: usize,
}

impl ControlLoop {
    async fn run(mut self) {
        tracing::info!(topics = ?self.config.topics, max_buffered = self.config.max_buffered, "streaming consumer starting");
        let outcome = self.consume().await;
        let error = match outcome {
            Ok(()) => None,
            Err(e) if e.kind() == ErrorKind::Stopped && self.shared.lifecycle.is_stopped() => {
                tracing::info!("streaming consumer stopped while retrying a broker call");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "streaming consumer halted");
                Some(e)
            }
        };
        let shared = Arc::clone(&self.shared);
        shared.lifecycle.stop_with(shared.close(error.as_ref())).await;
    }

    async fn consume(&mut self) -> Result<(), StreamError> {
        let connect_timeout = self.config.connection_timeout();
        let client = Arc::clone(&self.client);
        self.with_retries("connect", || {
            let client = Arc::clone(&client);
            async move {
                match tokio::time::timeout(connect_timeout, client.connect()).await {
                    Ok(connected) => connected,
                    Err(_) => Err(StreamError::transient("broker connection timed out")),
                }
            }
        })
        .await?;
        tracing::info!("streaming consumer connected");

        for name in self.config.topics.clone() {
            let next_offset = match self.config.start_offsets.get(&name) {
                Some(offset) => *offset,
                None => {
                    let client = Arc::clone(&self.client);
                    let topic = name.clone();
                    self.with_retries("committed offset", || {
                        let client = Arc::clone(&client);
                        let topic = topic.clone();
                        async move { client.committed_offset(&topic).await }
                    })
                    .await?
                    .unwrap_or(0)
                }
            };
            tracing::debug!(topic = %name, offset = next_offset, "starting position");
            self.topics.push(TopicState {
                name,
                buffer: VecDeque::new(),
                next_offset,
                in_flight: false,
                paused: false,
            });
        }

        loop {
            if self.shared.lifecycle.is_stopped() {
                return Ok(());
            }
            self.fill().await?;
            match self.pick() {
                Some(index) => {
                    if !self.deliver(index).await? {
                        return Ok(());
                    }
                }
                None => {
                    if !self.shared.lifecycle.sleep(self.config.poll_interval()).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Top up every topic that has room. A topic that fills up is paused
    /// until a delivery frees a slot.
    async fn fill(&mut self) -> Result<(), StreamError> {
        let max = self.config.max_buffered;
        for index in 0..self.topics.len() {
            let room = max.saturating_sub(self.topics[index].held());
            if room == 0 {
                continue;
            }
            let topic = &mut self.topics[index];
            if topic.paused {
                topic.paused = false;
                tracing::debug!(topic = %topic.name, "fetching resumed");
            }

            let client = Arc::clone(&self.client);
            let name = topic.name.clone();
            let from = topic.next_offset;
            let batch = self
                .with_retries("fetch", || {
                    let client = Arc::clone(&client);
                    let name = name.clone();
                    async move { client.fetch(&name, from, room).await }
                })
                .await?;
            if batch.is_empty() {
                continue;
            }

            let topic = &mut self.topics[index];
            // A broker returning more than asked for must not overflow the buffer.
            let fetched = batch.len().min(room);
            for record in batch.into_iter().take(fetched) {
                topic.next_offset = record.offset + 1;
                topic.buffer.push_back(record);
            }
            let full = topic.held() >= max;
            if full {
                topic.paused = true;
            }
            tracing::debug!(topic = %topic.name, fetched, next_offset = topic.next_offset, full, "records buffered");
            {
                let mut metrics = self.shared.metrics.lock().unwrap();
                metrics.fetched += fetched as u64;
                if full {
                    metrics.pauses += 1;
                }
            }
            self.publish_held(index);
        }
        Ok(())
    }

    /// Next topic with buffered records, round-robin.
    fn pick(&mut self) -> Option<usize> {
        let n = self.topics.len();
        let found = (0..n)
            .map(|i| (self.round_robin + i) % n)
            .find(|&i| !self.topics[i].buffer.is_empty())?;
        self.round_robin = (found + 1) % n;
        Some(found)
    }

    /// Deliver the head of topic `index`. Returns `false` once stopped.
    async fn deliver(&mut self, index: usize) -> Result<bool, StreamError> {
        let Some(record) = self.topics[index].buffer.pop_front() else {
            return Ok(true);
        };
        self.topics[index].in_flight = true;
        self.publish_held(index);

        let mut attempt = 0u32;
        let outcome = loop {
            let result = match self.decode(&record) {
                Ok(message) => {
                    let shared = Arc::clone(&self.shared);
                    let client = Arc::clone(&self.client);
                    let (topic, offset) = (record.topic.as_str(), record.offset);
                    let emitted = self
                        .shared
                        .lifecycle
                        .emit(async move {
                            shared.observer.next(message).await?;
                            if let Err(e) = client.commit(topic, offset + 1).await {
                                // Delivered either way; a lost commit means a redelivery on restart.
                                tracing::warn!(topic, offset, error = %e, "offset commit failed");
                            }
                            shared.metrics.lock().unwrap().delivered += 1;
                            Ok::<(), StreamError>(())
                        })
                        .await;
                    match emitted {
                        Some(result) => result,
                        None => break Ok(false),
                    }
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => break Ok(true),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        break Err(e.into_fatal());
                    }
                    self.shared.metrics.lock().unwrap().retries += 1;
                    tracing::warn!(
                        topic = %record.topic,
                        offset = record.offset,
                        attempt,
                        error = %e,
                        "message failed, retrying"
                    );
                    if !self.shared.lifecycle.sleep(self.config.retry_backoff(attempt)).await {
                        break Ok(false);
                    }
                }
            }
        };

        self.topics[index].in_flight = false;
        self.publish_held(index);
        outcome
    }

    fn decode(&self, record: &BrokerRecord) -> Result<ConsumedMessage, StreamError> {
        let message_type = record.header(MESSAGE_TYPE_HEADER).ok_or_else(|| {
            StreamError::serialization(format!(
                "record {}@{} carries no '{MESSAGE_TYPE_HEADER}' header",
                record.topic, record.offset
            ))
        })?;
        let value = self
            .coders
            .decode(message_type, record.header(SCHEMA_HEADER), &record.payload)?;
        Ok(ConsumedMessage {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
            message_type: message_type.to_string(),
            value,
        })
    }

    fn publish_held(&self, index: usize) {
        let topic = &self.topics[index];
        self.shared
            .buffered
            .lock()
            .unwrap()
            .insert(topic.name.clone(), topic.held());
    }

    /// Run a broker call, retrying with backoff. Exhaustion is fatal.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, StreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StreamError>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries || e.is_fatal() {
                        return Err(e.into_fatal());
                    }
                    self.shared.metrics.lock().unwrap().retries += 1;
                    tracing::warn!(call = what, attempt, error = %e, "broker call failed, retrying");
                    if !self.shared.lifecycle.sleep(self.config.retry_backoff(attempt)).await {
                        return Err(StreamError::stopped());
                    }
                }
            }
        }
    }
}
