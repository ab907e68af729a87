//! Block sources: where the producer gets chain data from.
//!
//! One capability, two fetch strategies selected by [`FetchMode`]:
//! `Standard` fetches the block and, when needed, its receipts in separate
//! calls; `BatchedReceipts` combines both into a single JSON-RPC batch.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainstream_core::{Block, Bloom, Log, LogFilter, Receipt, StreamError, Transaction};

use crate::failover::{BlockId, FailoverClient};
use crate::quantity::parse_quantity;

/// How full blocks are fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// `eth_getBlockByNumber`, then `eth_getBlockReceipts` when the bloom matches.
    #[default]
    Standard,
    /// Block and receipts in one batched round trip.
    BatchedReceipts,
}

/// Source of chain head numbers and full blocks.
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    /// Highest block number the chain currently reports.
    async fn fetch_latest_number(&self) -> Result<u64, StreamError>;

    /// Fully constructed block at `number`, or `None` if the node does not have it yet.
    async fn fetch_block(&self, number: u64) -> Result<Option<Block>, StreamError>;
}

/// What to fetch alongside each block header.
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    pub mode: FetchMode,
    pub include_transactions: bool,
    pub include_receipts: bool,
    /// Bloom pre-filter for receipt fetching; empty means every block qualifies.
    pub filter: LogFilter,
}

/// [`BlockSource`] over a [`FailoverClient`].
pub struct RpcBlockSource {
    client: Arc<FailoverClient>,
    options: SourceOptions,
}

impl RpcBlockSource {
    pub fn new(client: Arc<FailoverClient>, options: SourceOptions) -> Self {
        Self { client, options }
    }

    pub fn client(&self) -> &Arc<FailoverClient> {
        &self.client
    }

    /// Whether a block needs its receipts fetched in standard mode.
    fn wants_receipts(&self, block: &Block) -> Result<bool, StreamError> {
        if !self.options.include_receipts || block.transactions.is_empty() {
            return Ok(false);
        }
        if self.options.filter.is_empty() {
            return Ok(true);
        }
        match &block.logs_bloom {
            Some(hex) => Ok(self.options.filter.may_match(&Bloom::from_hex(hex)?)),
            None => Ok(true),
        }
    }
}

#[async_trait]
impl BlockSource for RpcBlockSource {
    async fn fetch_latest_number(&self) -> Result<u64, StreamError> {
        self.client.get_latest_block_number().await
    }

    async fn fetch_block(&self, number: u64) -> Result<Option<Block>, StreamError> {
        let include_txs = self.options.include_transactions;
        match self.options.mode {
            FetchMode::Standard => {
                let Some(raw) = self.client.get_block(BlockId::Number(number), include_txs).await? else {
                    return Ok(None);
                };
                let mut block = block_from_json(&raw)?;
                if self.wants_receipts(&block)? {
                    let receipts = self
                        .client
                        .get_block_receipts(number)
                        .await?
                        .ok_or_else(|| StreamError::protocol(format!("no receipts for block {number}")))?;
                    block.receipts = receipts_from_json(&receipts)?;
                } else {
                    tracing::debug!(block = number, "receipts skipped");
                }
                Ok(Some(block))
            }
            FetchMode::BatchedReceipts => {
                let (raw, receipts) = self.client.get_block_with_receipts(number, include_txs).await?;
                let Some(raw) = raw else {
                    return Ok(None);
                };
                let mut block = block_from_json(&raw)?;
                if self.options.include_receipts {
                    let receipts = receipts
                        .ok_or_else(|| StreamError::protocol(format!("no receipts for block {number}")))?;
                    block.receipts = receipts_from_json(&receipts)?;
                }
                Ok(Some(block))
            }
        }
    }
}

// ─── JSON normalization ───────────────────────────────────────────────────────

fn str_field<'a>(v: &'a Value, field: &str) -> Result<&'a str, StreamError> {
    v[field]
        .as_str()
        .ok_or_else(|| StreamError::protocol(format!("missing field '{field}'")))
}

fn quantity_field(v: &Value, field: &str) -> Result<u64, StreamError> {
    parse_quantity(str_field(v, field)?)
}

fn opt_string(v: &Value, field: &str) -> Option<String> {
    v[field].as_str().map(str::to_string)
}

/// Convert an `eth_getBlockBy*` result into a [`Block`].
///
/// Transactions may be full objects or bare hashes, depending on how the
/// block was requested.
pub fn block_from_json(v: &Value) -> Result<Block, StreamError> {
    let transactions = match v["transactions"].as_array() {
        Some(txs) => txs
            .iter()
            .map(|tx| -> Result<Transaction, StreamError> {
                match tx {
                    Value::String(hash) => Ok(Transaction { hash: hash.clone(), ..Default::default() }),
                    obj => Ok(Transaction {
                        hash: str_field(obj, "hash")?.to_string(),
                        from: opt_string(obj, "from"),
                        to: opt_string(obj, "to"),
                        value: opt_string(obj, "value"),
                        input: opt_string(obj, "input"),
                    }),
                }
            })
            .collect::<Result<Vec<_>, StreamError>>()?,
        None => Vec::new(),
    };

    Ok(Block {
        number: quantity_field(v, "number")?,
        hash: str_field(v, "hash")?.to_string(),
        parent_hash: str_field(v, "parentHash")?.to_string(),
        timestamp: quantity_field(v, "timestamp")?,
        logs_bloom: opt_string(v, "logsBloom"),
        transactions,
        receipts: Vec::new(),
    })
}

/// Convert an `eth_getBlockReceipts` result into [`Receipt`]s.
pub fn receipts_from_json(v: &Value) -> Result<Vec<Receipt>, StreamError> {
    let items = v
        .as_array()
        .ok_or_else(|| StreamError::protocol("receipts result is not an array"))?;
    items
        .iter()
        .map(|r| -> Result<Receipt, StreamError> {
            let logs = r["logs"]
                .as_array()
                .map(|logs| logs.iter().map(log_from_json).collect::<Result<Vec<_>, _>>())
                .transpose()?
                .unwrap_or_default();
            Ok(Receipt {
                transaction_hash: str_field(r, "transactionHash")?.to_string(),
                status: r["status"].as_str().map(parse_quantity).transpose()?,
                logs,
            })
        })
        .collect()
}

fn log_from_json(v: &Value) -> Result<Log, StreamError> {
    let topics = v["topics"]
        .as_array()
        .map(|ts| ts.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    Ok(Log {
        address: str_field(v, "address")?.to_string(),
        topics,
        data: opt_string(v, "data").unwrap_or_else(|| "0x".into()),
        log_index: quantity_field(v, "logIndex")?,
    })
}
