//! Fluent builder for [`ProducerConfig`].
//!
//! # Example
//!
//! ```rust,no_run
//! use chainstream_producer::{DiscoveryMode, ProducerBuilder};
//!
//! let config = ProducerBuilder::new()
//!     .endpoint("https://eth.llamarpc.com")
//!     .alternate_endpoint("https://rpc.ankr.com/eth")
//!     .start_block(19_000_000)
//!     .block_delay(12)
//!     .max_reorg_depth(64)
//!     .discovery(DiscoveryMode::Polling)
//!     .build_config();
//! ```

use chainstream_core::{LogFilter, StreamError};
use chainstream_rpc::FetchMode;

use crate::config::{DiscoveryMode, ProducerConfig};

#[derive(Default)]
pub struct ProducerBuilder {
    config: ProducerConfig,
}

impl ProducerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Append a primary endpoint.
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.endpoints.push(url.into());
        self
    }

    pub fn alternate_endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.alternate_endpoint = Some(url.into());
        self
    }

    /// WebSocket endpoint; also switches discovery to push.
    pub fn subscription_endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.subscription_endpoint = Some(url.into());
        self.config.discovery = DiscoveryMode::Push;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn subscription_timeout_ms(mut self, ms: u64) -> Self {
        self.config.subscription_timeout_ms = ms;
        self
    }

    pub fn rpc_timeout_ms(mut self, ms: u64) -> Self {
        self.config.rpc_timeout_ms = ms;
        self
    }

    /// Confirmation delay, in blocks behind the head.
    pub fn block_delay(mut self, blocks: u64) -> Self {
        self.config.block_delay = blocks;
        self
    }

    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.config.max_reorg_depth = depth;
        self
    }

    pub fn discovery(mut self, mode: DiscoveryMode) -> Self {
        self.config.discovery = mode;
        self
    }

    pub fn fetch_mode(mut self, mode: FetchMode) -> Self {
        self.config.fetch_mode = mode;
        self
    }

    pub fn include_transactions(mut self, yes: bool) -> Self {
        self.config.include_transactions = yes;
        self
    }

    pub fn include_receipts(mut self, yes: bool) -> Self {
        self.config.include_receipts = yes;
        self
    }

    pub fn log_filter(mut self, filter: LogFilter) -> Self {
        self.config.log_filter = filter;
        self
    }

    pub fn build_config(self) -> ProducerConfig {
        self.config
    }

    /// Build and validate.
    pub fn try_build(self) -> Result<ProducerConfig, StreamError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
