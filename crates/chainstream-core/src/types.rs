//! Block data model shared by the producer and the pipeline.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// Lightweight projection of a block, as pushed by a header subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct BlockHeader {
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
}

impl BlockHeader {
    /// Returns `true` if `self` is the direct child of `parent`.
    pub fn extends(&self, parent: &BlockRef) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A transaction as carried in a block. Chain-specific fields stay opaque strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub hash: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
}

/// A log emitted during transaction execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub log_index: u64,
}

/// A transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Receipt {
    pub transaction_hash: String,
    /// `1` = success, `0` = reverted; `None` for pre-Byzantium chains.
    pub status: Option<u64>,
    pub logs: Vec<Log>,
}

/// A fully fetched block: header, transactions and (where requested) receipts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    /// 256-byte logs bloom (`0x…`), when the chain provides one.
    #[serde(default)]
    pub logs_bloom: Option<String>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub receipts: Vec<Receipt>,
}

impl Block {
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            number: self.number,
            hash: self.hash.clone(),
            parent_hash: self.parent_hash.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            number: self.number,
            hash: self.hash.clone(),
            parent_hash: self.parent_hash.clone(),
        }
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockRef) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

/// The `(number, hash, parent_hash)` tuple retained for fork detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
}

// ─── ChainEvent ───────────────────────────────────────────────────────────────

/// Emitted once per resolved fork. Every block delivered above
/// `common_ancestor` is invalidated by this single notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct ReorgNotice {
    pub common_ancestor: u64,
    /// Number of delivered blocks rolled back.
    pub depth: u64,
    /// The candidate block number whose parent hash did not link.
    pub detected_at: u64,
}

/// An item of the validated block stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChainEvent {
    Block(Block),
    Reorg(ReorgNotice),
}

impl ChainEvent {
    /// The block number this event refers to (ancestor number for reorgs).
    pub fn number(&self) -> u64 {
        match self {
            Self::Block(b) => b.number,
            Self::Reorg(r) => r.common_ancestor,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str, parent: &str) -> Block {
        Block {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: number * 12,
            logs_bloom: None,
            transactions: vec![],
            receipts: vec![],
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = block(100, "0xaaa", "0x000");
        let child = block(101, "0xbbb", "0xaaa");
        assert!(child.extends(&parent.block_ref()));
        assert!(!parent.extends(&child.block_ref()));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = block(100, "0xaaa", "0x000");
        let b = block(102, "0xccc", "0xaaa");
        assert!(!b.extends(&a.block_ref()));
    }

    #[test]
    fn chain_event_json_is_tagged() {
        let ev = ChainEvent::Reorg(ReorgNotice {
            common_ancestor: 103,
            depth: 2,
            detected_at: 106,
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "reorg");
        assert_eq!(v["data"]["common_ancestor"], 103);
        assert_eq!(ev.number(), 103);
    }
}
