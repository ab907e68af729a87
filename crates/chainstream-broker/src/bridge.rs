//! `BlockPublisher`: forwards a producer's [`ChainEvent`] stream to broker topics.
//!
//! Blocks and reorg notices go to separate topics, keyed by block number, so
//! a downstream consumer can tell them apart without decoding. A failed
//! publish fails `next`, which stops the block producer.

use std::sync::Arc;

use async_trait::async_trait;

use chainstream_core::{ChainEvent, Observer, StreamError};

use crate::producer::{Publish, StreamingProducer};

/// Default message type for delivered blocks.
pub const BLOCK_MESSAGE_TYPE: &str = "block";
/// Default message type for reorg notices.
pub const REORG_MESSAGE_TYPE: &str = "reorg_notice";

/// Publishes every [`ChainEvent`] it observes.
pub struct BlockPublisher {
    producer: Arc<StreamingProducer>,
    block_topic: String,
    reorg_topic: String,
    block_type: String,
    reorg_type: String,
}

impl BlockPublisher {
    /// Publish to `blocks` and `reorgs` with the default message types.
    pub fn new(producer: Arc<StreamingProducer>) -> Self {
        Self {
            producer,
            block_topic: "blocks".into(),
            reorg_topic: "reorgs".into(),
            block_type: BLOCK_MESSAGE_TYPE.into(),
            reorg_type: REORG_MESSAGE_TYPE.into(),
        }
    }

    pub fn block_topic(mut self, topic: impl Into<String>) -> Self {
        self.block_topic = topic.into();
        self
    }

    pub fn reorg_topic(mut self, topic: impl Into<String>) -> Self {
        self.reorg_topic = topic.into();
        self
    }

    pub fn message_types(mut self, block: impl Into<String>, reorg: impl Into<String>) -> Self {
        self.block_type = block.into();
        self.reorg_type = reorg.into();
        self
    }
}

#[async_trait]
impl Observer<ChainEvent> for BlockPublisher {
    async fn next(&self, event: ChainEvent) -> Result<(), StreamError> {
        let message = match &event {
            ChainEvent::Block(block) => Publish::new(
                &self.block_topic,
                &self.block_type,
                serde_json::to_value(block)?,
            )
            .key(block.number.to_string()),
            ChainEvent::Reorg(notice) => Publish::new(
                &self.reorg_topic,
                &self.reorg_type,
                serde_json::to_value(notice)?,
            )
            .key(notice.common_ancestor.to_string()),
        };
        let report = self.producer.publish(message).await?;
        tracing::debug!(block = event.number(), delivery_id = report.delivery_id, "chain event published");
        Ok(())
    }

    async fn error(&self, error: &StreamError) {
        tracing::error!(error = %error, "block stream failed");
    }

    async fn closed(&self) {
        if let Err(e) = self.producer.flush().await {
            tracing::warn!(error = %e, "flush after block stream closed failed");
        }
    }
}
