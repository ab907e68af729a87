//! Block producer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use chainstream_core::{LogFilter, StreamError};
use chainstream_rpc::{FailoverConfig, FetchMode, RetryConfig, SourceOptions};

/// Upper bound on `max_reorg_depth`; the window is preallocated.
pub const MAX_REORG_DEPTH: u64 = 65_536;

/// How new blocks are discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Ask for the head number on a fixed interval.
    #[default]
    Polling,
    /// React to headers pushed by a subscription.
    Push,
}

/// Configuration for a [`BlockProducer`](crate::BlockProducer) instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// First block to deliver.
    #[serde(default)]
    pub start_block: u64,
    /// Primary RPC endpoints, tried in order.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Fallback endpoint used once every primary is exhausted.
    #[serde(default)]
    pub alternate_endpoint: Option<String>,
    /// WebSocket endpoint for push discovery.
    #[serde(default)]
    pub subscription_endpoint: Option<String>,
    /// Retries per endpoint, and per subscription attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Polling interval (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Longest silence tolerated on a push subscription (milliseconds).
    #[serde(default = "default_subscription_timeout_ms")]
    pub subscription_timeout_ms: u64,
    /// Upper bound on a single RPC attempt (milliseconds).
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Blocks a candidate must trail the head by before delivery.
    #[serde(default)]
    pub block_delay: u64,
    /// Deepest fork that can be resolved.
    #[serde(default = "default_max_reorg_depth")]
    pub max_reorg_depth: u64,
    #[serde(default)]
    pub discovery: DiscoveryMode,
    #[serde(default)]
    pub fetch_mode: FetchMode,
    #[serde(default = "default_true")]
    pub include_transactions: bool,
    #[serde(default)]
    pub include_receipts: bool,
    /// Bloom pre-filter applied before fetching receipts.
    #[serde(default)]
    pub log_filter: LogFilter,
}

fn default_max_retries() -> u32 { 3 }
fn default_poll_interval_ms() -> u64 { 2_000 }
fn default_subscription_timeout_ms() -> u64 { 30_000 }
fn default_rpc_timeout_ms() -> u64 { 10_000 }
fn default_max_reorg_depth() -> u64 { 64 }
fn default_true() -> bool { true }

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            endpoints: Vec::new(),
            alternate_endpoint: None,
            subscription_endpoint: None,
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            subscription_timeout_ms: default_subscription_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            block_delay: 0,
            max_reorg_depth: default_max_reorg_depth(),
            discovery: DiscoveryMode::default(),
            fetch_mode: FetchMode::default(),
            include_transactions: true,
            include_receipts: false,
            log_filter: LogFilter::default(),
        }
    }
}

impl ProducerConfig {
    /// Reject configurations no instance could run with.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.endpoints.is_empty() && self.alternate_endpoint.is_none() {
            return Err(StreamError::configuration("no RPC endpoint configured"));
        }
        if self.poll_interval_ms == 0 {
            return Err(StreamError::configuration("poll_interval_ms must be positive"));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(StreamError::configuration("rpc_timeout_ms must be positive"));
        }
        if self.max_reorg_depth > MAX_REORG_DEPTH {
            return Err(StreamError::configuration(format!(
                "max_reorg_depth must not exceed {MAX_REORG_DEPTH}"
            )));
        }
        if self.subscription_timeout_ms == 0 {
            return Err(StreamError::configuration("subscription_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn subscription_timeout(&self) -> Duration {
        Duration::from_millis(self.subscription_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Backoff used for endpoint retries and resubscription.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            ..RetryConfig::default()
        }
    }

    pub fn failover(&self) -> FailoverConfig {
        FailoverConfig {
            retry: self.retry(),
            rpc_timeout: self.rpc_timeout(),
        }
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            mode: self.fetch_mode,
            include_transactions: self.include_transactions,
            include_receipts: self.include_receipts,
            filter: self.log_filter.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainstream_core::ErrorKind;

    fn with_endpoint() -> ProducerConfig {
        ProducerConfig {
            endpoints: vec!["http://localhost:8545".into()],
            ..Default::default()
        }
    }

    #[test]
    fn defaults_from_empty_json() {
        let cfg: ProducerConfig = serde_json::from_str(r#"{"endpoints": ["http://a"]}"#).unwrap();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_reorg_depth, 64);
        assert_eq!(cfg.discovery, DiscoveryMode::Polling);
        assert_eq!(cfg.fetch_mode, FetchMode::Standard);
        assert!(cfg.include_transactions);
        cfg.validate().unwrap();
    }

    #[test]
    fn modes_parse_from_tags() {
        let cfg: ProducerConfig = serde_json::from_str(
            r#"{"alternate_endpoint": "http://b", "discovery": "push", "fetch_mode": "batched_receipts"}"#,
        )
        .unwrap();
        assert_eq!(cfg.discovery, DiscoveryMode::Push);
        assert_eq!(cfg.fetch_mode, FetchMode::BatchedReceipts);
        cfg.validate().unwrap();
    }

    #[test]
    fn validate_rejects_unusable_configs() {
        let err = ProducerConfig::default().validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let cfg = ProducerConfig { poll_interval_ms: 0, ..with_endpoint() };
        assert!(cfg.validate().is_err());

        let cfg = ProducerConfig { rpc_timeout_ms: 0, ..with_endpoint() };
        assert!(cfg.validate().is_err());

        let cfg = ProducerConfig { max_reorg_depth: MAX_REORG_DEPTH + 1, ..with_endpoint() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_reorg_depth_is_valid() {
        let cfg = ProducerConfig { max_reorg_depth: 0, ..with_endpoint() };
        cfg.validate().unwrap();
    }
}
