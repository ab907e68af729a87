//! Publisher → memory broker → consumer pipelines.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use chainstream_broker::{
    AckMode, BlockPublisher, ConsumedMessage, ConsumerConfig, MemoryBroker, ProducerEvent,
    Publish, PublisherConfig, StreamingConsumer, StreamingProducer, BLOCK_MESSAGE_TYPE,
    MESSAGE_TYPE_HEADER, REORG_MESSAGE_TYPE,
};
use chainstream_core::{
    Block, BorshCoder, ChannelObserver, CoderRegistry, ErrorKind, JsonCoder, Notification,
    Observer, ReorgNotice, StreamError, Transaction,
};
use chainstream_producer::{BlockProducer, ProducerBuilder};
use chainstream_rpc::BlockSource;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn registry() -> CoderRegistry {
    let r = CoderRegistry::new();
    r.register(BLOCK_MESSAGE_TYPE, "chainstream.v1", Arc::new(BorshCoder::<Block>::new())).unwrap();
    r.register(REORG_MESSAGE_TYPE, "chainstream.v1", Arc::new(BorshCoder::<ReorgNotice>::new())).unwrap();
    r.register("note", "json", Arc::new(JsonCoder)).unwrap();
    r
}

fn note_headers() -> BTreeMap<String, String> {
    let mut h = BTreeMap::new();
    h.insert(MESSAGE_TYPE_HEADER.to_string(), "note".to_string());
    h
}

fn block(number: u64) -> Block {
    Block {
        number,
        hash: format!("0x{number:02x}"),
        parent_hash: if number == 0 { "0x0".into() } else { format!("0x{:02x}", number - 1) },
        timestamp: number * 12,
        logs_bloom: None,
        transactions: vec![Transaction {
            hash: format!("0xt{number}"),
            from: Some("0xaa".into()),
            to: None,
            ..Transaction::default()
        }],
        receipts: vec![],
    }
}

async fn next_message(
    rx: &mut tokio::sync::mpsc::Receiver<Notification<ConsumedMessage>>,
) -> ConsumedMessage {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(Notification::Next(m))) => m,
        other => panic!("expected a message, got {other:?}"),
    }
}

/// `next` blocks until a permit is granted.
struct GatedObserver {
    gate: Semaphore,
    entered: AtomicUsize,
}

#[async_trait]
impl Observer<ConsumedMessage> for GatedObserver {
    async fn next(&self, _message: ConsumedMessage) -> Result<(), StreamError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| StreamError::handler("gate closed"))?;
        permit.forget();
        Ok(())
    }
}

// ─── Backpressure ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_c_full_buffer_pauses_fetching() {
    let broker = Arc::new(MemoryBroker::new());
    for i in 0..10u64 {
        broker.append("events", Some(&i.to_string()), serde_json::to_vec(&i).unwrap(), note_headers());
    }
    let config = ConsumerConfig {
        max_buffered: 3,
        poll_interval_ms: 5,
        ..ConsumerConfig::for_topics(["events"]).bind("note", "json")
    };
    let observer = Arc::new(GatedObserver { gate: Semaphore::new(0), entered: AtomicUsize::new(0) });
    let handle = StreamingConsumer::new(config, broker.clone(), &registry())
        .unwrap()
        .start(observer.clone());

    tokio::time::timeout(Duration::from_secs(5), async {
        while observer.entered.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // `next` has not returned: exactly one fetch of three records, nothing more.
    assert_eq!(broker.fetched_count(), 3);
    assert_eq!(broker.fetch_calls(), 1);
    assert_eq!(handle.buffered("events"), 3);
    assert_eq!(observer.entered.load(Ordering::SeqCst), 1);
    assert_eq!(handle.metrics().delivered, 0);
    assert_eq!(handle.metrics().pauses, 1);

    // Let the application drain everything; the buffer never exceeds its bound.
    observer.gate.add_permits(10);
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.metrics().delivered < 10 {
            assert!(handle.buffered("events") <= 3);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(broker.fetched_count(), 10);
    assert_eq!(broker.committed("events"), Some(10));
    handle.stop().await;
}

// ─── Publishing ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn delivery_timeout_is_observable() {
    let broker = Arc::new(MemoryBroker::new());
    broker.set_ack_mode(AckMode::Withhold);
    let config = PublisherConfig { delivery_timeout_ms: 40, poll_interval_ms: 5, ..PublisherConfig::default() }
        .bind("note", "json");
    let producer = StreamingProducer::new(config, broker.clone(), &registry()).unwrap();
    let mut events = producer.subscribe_events();

    let err = producer
        .publish(Publish::new("notes", "note", serde_json::json!({"n": 1})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeliveryTimeout);

    assert_eq!(events.recv().await.unwrap(), ProducerEvent::Connected);
    assert!(matches!(events.recv().await.unwrap(), ProducerEvent::Error(_)));

    // A late acknowledgement is reported as an event but settles nothing.
    broker.release_withheld();
    match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
        Ok(Ok(ProducerEvent::Delivery(report))) => assert!(report.is_acknowledged()),
        other => panic!("expected late delivery event, got {other:?}"),
    }
    assert_eq!(producer.in_flight(), 0);
}

#[tokio::test]
async fn flush_times_out_while_acknowledgements_are_withheld() {
    let broker = Arc::new(MemoryBroker::new());
    broker.set_ack_mode(AckMode::Withhold);
    let config = PublisherConfig {
        delivery_timeout_ms: 5_000,
        poll_interval_ms: 5,
        flush_timeout_ms: 50,
        ..PublisherConfig::default()
    }
    .bind("note", "json");
    let producer = Arc::new(StreamingProducer::new(config, broker.clone(), &registry()).unwrap());

    let publisher = Arc::clone(&producer);
    let pending = tokio::spawn(async move { publisher.publish_typed("notes", None, "note", &1u8).await });
    while producer.in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let err = producer.flush().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeliveryTimeout);

    broker.release_withheld();
    producer.flush().await.unwrap();
    assert!(pending.await.unwrap().unwrap().is_acknowledged());
}

// ─── Round trip ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn published_blocks_decode_on_the_consumer_side() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry();
    let publisher_config = PublisherConfig { poll_interval_ms: 5, ..PublisherConfig::default() }
        .bind(BLOCK_MESSAGE_TYPE, "chainstream.v1")
        .bind("note", "json");
    let producer = StreamingProducer::new(publisher_config, broker.clone(), &registry).unwrap();

    let sent: Vec<Block> = (10..13).map(block).collect();
    for b in &sent {
        producer
            .publish_typed("blocks", Some(&b.number.to_string()), BLOCK_MESSAGE_TYPE, b)
            .await
            .unwrap();
    }
    producer
        .publish_typed("blocks", None, "note", &serde_json::json!({"text": "mixed types"}))
        .await
        .unwrap();
    producer.disconnect().await.unwrap();

    let consumer_config = ConsumerConfig { poll_interval_ms: 5, ..ConsumerConfig::for_topics(["blocks"]) }
        .bind(BLOCK_MESSAGE_TYPE, "chainstream.v1")
        .bind("note", "json");
    let (observer, mut rx) = ChannelObserver::new(16);
    let handle = StreamingConsumer::new(consumer_config, broker.clone(), &registry)
        .unwrap()
        .start(Arc::new(observer));

    for expected in &sent {
        let message = next_message(&mut rx).await;
        assert_eq!(message.message_type, BLOCK_MESSAGE_TYPE);
        assert_eq!(message.key, Some(expected.number.to_string()));
        assert_eq!(&message.decode::<Block>().unwrap(), expected);
    }
    let note = next_message(&mut rx).await;
    assert_eq!(note.message_type, "note");
    assert_eq!(note.value["text"], "mixed types");

    handle.stop().await;
}

// ─── End to end ───────────────────────────────────────────────────────────────

/// A fixed, fork-free chain.
struct StaticChain {
    head: u64,
}

#[async_trait]
impl BlockSource for StaticChain {
    async fn fetch_latest_number(&self) -> Result<u64, StreamError> {
        Ok(self.head)
    }

    async fn fetch_block(&self, number: u64) -> Result<Option<Block>, StreamError> {
        Ok((number <= self.head).then(|| block(number)))
    }
}

#[tokio::test]
async fn block_producer_feeds_consumer_through_broker() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry();

    let publisher_config = PublisherConfig { poll_interval_ms: 5, ..PublisherConfig::default() }
        .bind(BLOCK_MESSAGE_TYPE, "chainstream.v1")
        .bind(REORG_MESSAGE_TYPE, "chainstream.v1");
    let publisher = Arc::new(StreamingProducer::new(publisher_config, broker.clone(), &registry).unwrap());

    let producer_config = ProducerBuilder::new()
        .endpoint("mock://chain")
        .start_block(3)
        .poll_interval_ms(10)
        .build_config();
    let block_producer = BlockProducer::new(producer_config, Arc::new(StaticChain { head: 8 }))
        .unwrap()
        .start(Arc::new(BlockPublisher::new(Arc::clone(&publisher))));

    let consumer_config = ConsumerConfig {
        max_buffered: 2,
        poll_interval_ms: 5,
        ..ConsumerConfig::for_topics(["blocks"])
    }
    .bind(BLOCK_MESSAGE_TYPE, "chainstream.v1");
    let (observer, mut rx) = ChannelObserver::new(16);
    let consumer = StreamingConsumer::new(consumer_config, broker.clone(), &registry)
        .unwrap()
        .start(Arc::new(observer));

    for n in 3..=8 {
        let message = next_message(&mut rx).await;
        assert_eq!(message.decode::<Block>().unwrap(), block(n));
    }

    block_producer.stop().await;
    consumer.stop().await;
    publisher.disconnect().await.unwrap();
    assert!(broker.records("reorgs").is_empty());
}
