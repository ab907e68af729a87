//! In-process broker.
//!
//! One ordered log per topic; offsets are log indices. Acknowledgement
//! behaviour is switchable so publishers can be tested against slow or
//! refusing brokers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use chainstream_core::StreamError;

use crate::client::{
    BrokerConsumerClient, BrokerProducerClient, BrokerRecord, DeliveryReport, DeliveryStatus,
    ProducerRecord,
};

/// How [`MemoryBroker`] answers a sent record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AckMode {
    /// Append and acknowledge on the next poll.
    #[default]
    Immediate,
    /// Hold the record without reporting until [`MemoryBroker::release_withheld`].
    Withhold,
    /// Drop the record and report a rejection.
    Reject(String),
}

#[derive(Default)]
struct Inner {
    logs: HashMap<String, Vec<BrokerRecord>>,
    committed: HashMap<String, u64>,
    withheld: Vec<ProducerRecord>,
    reports: VecDeque<DeliveryReport>,
    ack_mode: AckMode,
    connections: u64,
    fetched: u64,
    fetch_calls: u64,
}

impl Inner {
    fn append(&mut self, record: ProducerRecord) -> DeliveryReport {
        let log = self.logs.entry(record.topic.clone()).or_default();
        let offset = log.len() as u64;
        let partition = record.partition.unwrap_or(0);
        log.push(BrokerRecord {
            topic: record.topic.clone(),
            partition,
            offset,
            key: record.key,
            payload: record.payload,
            timestamp: record.timestamp.unwrap_or_else(Utc::now),
            headers: record.headers,
        });
        DeliveryReport {
            delivery_id: record.delivery_id,
            topic: record.topic,
            status: DeliveryStatus::Acknowledged { partition, offset },
        }
    }
}

/// A broker living entirely in memory. Implements both client traits.
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ack_mode(&self, mode: AckMode) {
        self.inner.lock().unwrap().ack_mode = mode;
    }

    /// Append and acknowledge every withheld record.
    pub fn release_withheld(&self) {
        let mut inner = self.inner.lock().unwrap();
        let withheld = std::mem::take(&mut inner.withheld);
        for record in withheld {
            let report = inner.append(record);
            inner.reports.push_back(report);
        }
    }

    /// Append a record directly, bypassing delivery reports. Returns its offset.
    pub fn append(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: impl Into<Bytes>,
        headers: BTreeMap<String, String>,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let offset = inner.logs.get(topic).map_or(0, |log| log.len() as u64);
        inner.append(ProducerRecord {
            delivery_id: 0,
            topic: topic.to_string(),
            key: key.map(str::to_string),
            payload: payload.into(),
            partition: None,
            timestamp: None,
            headers,
        });
        offset
    }

    /// Snapshot of a topic's log.
    pub fn records(&self, topic: &str) -> Vec<BrokerRecord> {
        self.inner.lock().unwrap().logs.get(topic).cloned().unwrap_or_default()
    }

    /// Total records returned by `fetch` so far.
    pub fn fetched_count(&self) -> u64 {
        self.inner.lock().unwrap().fetched
    }

    /// Number of `fetch` calls that returned at least one record.
    pub fn fetch_calls(&self) -> u64 {
        self.inner.lock().unwrap().fetch_calls
    }

    pub fn connections(&self) -> u64 {
        self.inner.lock().unwrap().connections
    }

    pub fn committed(&self, topic: &str) -> Option<u64> {
        self.inner.lock().unwrap().committed.get(topic).copied()
    }
}

#[async_trait]
impl BrokerProducerClient for MemoryBroker {
    async fn connect(&self) -> Result<(), StreamError> {
        self.inner.lock().unwrap().connections += 1;
        Ok(())
    }

    async fn send(&self, record: ProducerRecord) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.ack_mode.clone() {
            AckMode::Immediate => {
                let report = inner.append(record);
                inner.reports.push_back(report);
            }
            AckMode::Withhold => inner.withheld.push(record),
            AckMode::Reject(reason) => inner.reports.push_back(DeliveryReport {
                delivery_id: record.delivery_id,
                topic: record.topic,
                status: DeliveryStatus::Rejected { reason },
            }),
        }
        Ok(())
    }

    async fn poll_deliveries(&self) -> Result<Vec<DeliveryReport>, StreamError> {
        Ok(self.inner.lock().unwrap().reports.drain(..).collect())
    }

    fn pending_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.withheld.len() + inner.reports.len()
    }
}

#[async_trait]
impl BrokerConsumerClient for MemoryBroker {
    async fn connect(&self) -> Result<(), StreamError> {
        self.inner.lock().unwrap().connections += 1;
        Ok(())
    }

    async fn committed_offset(&self, topic: &str) -> Result<Option<u64>, StreamError> {
        Ok(self.committed(topic))
    }

    async fn fetch(&self, topic: &str, from: u64, max: usize) -> Result<Vec<BrokerRecord>, StreamError> {
        let mut inner = self.inner.lock().unwrap();
        let batch: Vec<BrokerRecord> = inner
            .logs
            .get(topic)
            .map(|log| log.iter().skip(from as usize).take(max).cloned().collect())
            .unwrap_or_default();
        if !batch.is_empty() {
            inner.fetched += batch.len() as u64;
            inner.fetch_calls += 1;
        }
        Ok(batch)
    }

    async fn commit(&self, topic: &str, offset: u64) -> Result<(), StreamError> {
        self.inner.lock().unwrap().committed.insert(topic.to_string(), offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, topic: &str) -> ProducerRecord {
        ProducerRecord {
            delivery_id: id,
            topic: topic.into(),
            key: Some(id.to_string()),
            payload: Bytes::from(vec![id as u8]),
            partition: None,
            timestamp: None,
            headers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn immediate_mode_appends_and_reports() {
        let broker = MemoryBroker::new();
        broker.send(record(1, "t")).await.unwrap();
        broker.send(record(2, "t")).await.unwrap();
        assert_eq!(broker.pending_count(), 2);

        let reports = broker.poll_deliveries().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].status, DeliveryStatus::Acknowledged { partition: 0, offset: 1 });
        assert_eq!(broker.pending_count(), 0);
        assert_eq!(broker.records("t").len(), 2);
    }

    #[tokio::test]
    async fn withheld_records_report_after_release() {
        let broker = MemoryBroker::new();
        broker.set_ack_mode(AckMode::Withhold);
        broker.send(record(1, "t")).await.unwrap();
        assert!(broker.poll_deliveries().await.unwrap().is_empty());
        assert_eq!(broker.pending_count(), 1);

        broker.release_withheld();
        let reports = broker.poll_deliveries().await.unwrap();
        assert_eq!(reports[0].delivery_id, 1);
        assert!(reports[0].is_acknowledged());
    }

    #[tokio::test]
    async fn rejected_records_are_not_stored() {
        let broker = MemoryBroker::new();
        broker.set_ack_mode(AckMode::Reject("quota".into()));
        broker.send(record(1, "t")).await.unwrap();
        let reports = broker.poll_deliveries().await.unwrap();
        assert_eq!(reports[0].status, DeliveryStatus::Rejected { reason: "quota".into() });
        assert!(broker.records("t").is_empty());
    }

    #[tokio::test]
    async fn fetch_pages_by_offset_and_counts() {
        let broker = MemoryBroker::new();
        for i in 0..5u8 {
            broker.append("t", None, vec![i], BTreeMap::new());
        }
        let page = broker.fetch("t", 3, 10).await.unwrap();
        assert_eq!(page.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![3, 4]);
        assert!(broker.fetch("t", 5, 10).await.unwrap().is_empty());
        assert_eq!(broker.fetched_count(), 2);
        assert_eq!(broker.fetch_calls(), 1);

        broker.commit("t", 5).await.unwrap();
        assert_eq!(broker.committed_offset("t").await.unwrap(), Some(5));
    }
}
