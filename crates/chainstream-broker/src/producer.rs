//! `StreamingProducer`: encode, hand to the broker, await the acknowledgement.
//!
//! Every publish registers a one-shot waiter under a locally assigned
//! delivery id *before* the record leaves, so a fast acknowledgement can
//! never be missed. A background poller drains delivery reports on
//! `poll_interval_ms` and settles the matching waiters.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use chainstream_core::{CoderRegistry, ErrorKind, Lifecycle, ResolvedCoders, StreamError};

use crate::client::{
    BrokerProducerClient, DeliveryReport, DeliveryStatus, ProducerRecord, MESSAGE_TYPE_HEADER,
    SCHEMA_HEADER,
};
use crate::config::PublisherConfig;

// ─── Events and metrics ───────────────────────────────────────────────────────

/// Lifecycle events, observable independently of any single publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerEvent {
    Connected,
    Delivery(DeliveryReport),
    Error(String),
}

/// Counters for one publisher instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublisherMetrics {
    pub published: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub timed_out: u64,
}

// ─── Outgoing message ─────────────────────────────────────────────────────────

/// One message to publish.
#[derive(Debug, Clone)]
pub struct Publish {
    topic: String,
    message_type: String,
    value: Value,
    key: Option<String>,
    partition: Option<u32>,
    timestamp: Option<DateTime<Utc>>,
}

impl Publish {
    pub fn new(topic: impl Into<String>, message_type: impl Into<String>, value: Value) -> Self {
        Self {
            topic: topic.into(),
            message_type: message_type.into(),
            value,
            key: None,
            partition: None,
            timestamp: None,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

// ─── Producer ─────────────────────────────────────────────────────────────────

struct Inner {
    config: PublisherConfig,
    client: Arc<dyn BrokerProducerClient>,
    coders: ResolvedCoders,
    waiters: Mutex<HashMap<u64, oneshot::Sender<DeliveryReport>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<ProducerEvent>,
    metrics: Mutex<PublisherMetrics>,
    lifecycle: Lifecycle,
}

impl Inner {
    fn event(&self, event: ProducerEvent) {
        // No subscriber is not an error.
        let _ = self.events.send(event);
    }

    fn settle(&self, report: DeliveryReport) {
        {
            let mut m = self.metrics.lock().unwrap();
            match report.status {
                DeliveryStatus::Acknowledged { .. } => m.acknowledged += 1,
                DeliveryStatus::Rejected { .. } => m.rejected += 1,
            }
        }
        self.event(ProducerEvent::Delivery(report.clone()));
        let waiter = self.waiters.lock().unwrap().remove(&report.delivery_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(report);
            }
            None => tracing::debug!(
                delivery_id = report.delivery_id,
                topic = %report.topic,
                "delivery report without a waiter"
            ),
        }
    }

    async fn poll_once(&self) {
        match self.client.poll_deliveries().await {
            Ok(reports) => {
                for report in reports {
                    self.settle(report);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "polling delivery reports failed");
                self.event(ProducerEvent::Error(e.to_string()));
            }
        }
    }
}

async fn poll_loop(inner: Arc<Inner>) {
    let interval = inner.config.poll_interval();
    loop {
        inner.poll_once().await;
        if !inner.lifecycle.sleep(interval).await {
            break;
        }
    }
    tracing::debug!("delivery poller exited");
}

/// Publishes coder-encoded messages to broker topics.
pub struct StreamingProducer {
    inner: Arc<Inner>,
    poller: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamingProducer {
    /// Resolve every binding against `registry`; an unresolved type is a
    /// configuration error here, not at publish time.
    pub fn new(
        config: PublisherConfig,
        client: Arc<dyn BrokerProducerClient>,
        registry: &CoderRegistry,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let coders = registry.resolve(&config.bindings)?;
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                coders,
                waiters: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                events,
                metrics: Mutex::new(PublisherMetrics::default()),
                lifecycle: Lifecycle::new(),
            }),
            poller: tokio::sync::Mutex::new(None),
        })
    }

    /// Subscribe to connect/delivery/error events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProducerEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> PublisherMetrics {
        self.inner.metrics.lock().unwrap().clone()
    }

    /// Publishes awaiting an acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.inner.waiters.lock().unwrap().len()
    }

    /// Connect to the broker and start the acknowledgement poller.
    /// Idempotent; `publish` calls it on first use.
    pub async fn connect(&self) -> Result<(), StreamError> {
        if self.inner.lifecycle.is_stopped() {
            return Err(StreamError::stopped());
        }
        let mut poller = self.poller.lock().await;
        if poller.is_some() {
            return Ok(());
        }
        if let Err(e) = self.inner.client.connect().await {
            self.inner.event(ProducerEvent::Error(e.to_string()));
            return Err(e);
        }
        *poller = Some(tokio::spawn(poll_loop(Arc::clone(&self.inner))));
        tracing::info!("streaming producer connected");
        self.inner.event(ProducerEvent::Connected);
        Ok(())
    }

    /// Encode and publish one message; resolves with the acknowledgement.
    ///
    /// Fails with `DeliveryTimeout` if no report arrives in time, and with a
    /// `TransientNetwork` error if the broker rejects the record.
    pub async fn publish(&self, message: Publish) -> Result<DeliveryReport, StreamError> {
        self.connect().await?;
        let inner = &self.inner;

        let (schema, payload) = match inner.coders.encode(&message.message_type, &message.value) {
            Ok(encoded) => encoded,
            Err(e) => {
                inner.event(ProducerEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let delivery_id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        inner.waiters.lock().unwrap().insert(delivery_id, tx);

        let mut headers = BTreeMap::new();
        headers.insert(MESSAGE_TYPE_HEADER.to_string(), message.message_type.clone());
        headers.insert(SCHEMA_HEADER.to_string(), schema);
        let record = ProducerRecord {
            delivery_id,
            topic: message.topic.clone(),
            key: message.key,
            payload,
            partition: message.partition,
            timestamp: message.timestamp,
            headers,
        };

        let started = Instant::now();
        // The deadline covers the send as well as the acknowledgement.
        let topic = message.topic.clone();
        let message_type = message.message_type.clone();
        let sent_and_settled = async move {
            if let Err(e) = inner.client.send(record).await {
                inner.waiters.lock().unwrap().remove(&delivery_id);
                inner.event(ProducerEvent::Error(e.to_string()));
                return Err(e);
            }
            inner.metrics.lock().unwrap().published += 1;
            tracing::debug!(topic = %topic, delivery_id, message_type = %message_type, "record sent");
            rx.await.map_err(|_| StreamError::stopped())
        };

        let report = match tokio::time::timeout(inner.config.delivery_timeout(), sent_and_settled).await {
            Ok(settled) => settled?,
            Err(_) => {
                inner.waiters.lock().unwrap().remove(&delivery_id);
                inner.metrics.lock().unwrap().timed_out += 1;
                let e = StreamError::delivery_timeout(&message.topic, inner.config.delivery_timeout_ms);
                tracing::error!(topic = %message.topic, delivery_id, "delivery timed out");
                inner.event(ProducerEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        match &report.status {
            DeliveryStatus::Acknowledged { partition, offset } => {
                tracing::debug!(
                    topic = %report.topic,
                    partition,
                    offset,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "delivery acknowledged"
                );
                Ok(report)
            }
            DeliveryStatus::Rejected { reason } => {
                tracing::warn!(topic = %report.topic, delivery_id, reason = %reason, "delivery rejected");
                Err(StreamError::transient(format!(
                    "broker rejected record for topic '{}': {reason}",
                    report.topic
                )))
            }
        }
    }

    /// Serialize `value` to JSON, then publish it as `message_type`.
    pub async fn publish_typed<T: Serialize>(
        &self,
        topic: &str,
        key: Option<&str>,
        message_type: &str,
        value: &T,
    ) -> Result<DeliveryReport, StreamError> {
        let mut message = Publish::new(topic, message_type, serde_json::to_value(value)?);
        if let Some(k) = key {
            message = message.key(k);
        }
        self.publish(message).await
    }

    /// Wait until every in-flight publish has been settled, up to the flush timeout.
    pub async fn flush(&self) -> Result<(), StreamError> {
        let deadline = Instant::now() + self.inner.config.flush_timeout();
        loop {
            self.inner.poll_once().await;
            let remaining = self.in_flight();
            if remaining == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!(remaining, "flush timed out");
                return Err(StreamError::new(
                    ErrorKind::DeliveryTimeout,
                    format!("{remaining} deliveries still pending after {}ms", self.inner.config.flush_timeout_ms),
                ));
            }
            tokio::time::sleep(self.inner.config.poll_interval()).await;
        }
    }

    /// Flush, then stop the poller. Publishes still waiting fail with `Stopped`.
    pub async fn disconnect(&self) -> Result<(), StreamError> {
        let flushed = self.flush().await;
        self.inner.lifecycle.stop().await;
        if let Some(poller) = self.poller.lock().await.take() {
            let _ = poller.await;
        }
        self.inner.waiters.lock().unwrap().clear();
        tracing::info!("streaming producer disconnected");
        flushed
    }
}

impl Drop for StreamingProducer {
    fn drop(&mut self) {
        self.inner.lifecycle.request_stop();
    }
}
