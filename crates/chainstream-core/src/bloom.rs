//! Logs-bloom membership checks.
//!
//! A 2048-bit bloom: each item sets three bits taken from the low 11 bits
//! of the first three big-endian byte pairs of `keccak256(item)`.

use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};

use crate::error::StreamError;

pub const BLOOM_BYTES: usize = 256;

/// A parsed 256-byte logs bloom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bloom([u8; BLOOM_BYTES]);

impl Bloom {
    pub fn empty() -> Self {
        Self([0u8; BLOOM_BYTES])
    }

    /// Parse a `0x`-prefixed (or bare) hex bloom.
    pub fn from_hex(s: &str) -> Result<Self, StreamError> {
        let raw = hex::decode(s.strip_prefix("0x").unwrap_or(s))
            .map_err(|e| StreamError::protocol("logs bloom is not valid hex").with_cause(e))?;
        let bytes: [u8; BLOOM_BYTES] = raw.try_into().map_err(|v: Vec<u8>| {
            StreamError::protocol(format!("logs bloom has {} bytes, expected {BLOOM_BYTES}", v.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Set the three bits for `item`.
    pub fn accrue(&mut self, item: &[u8]) {
        for (byte, mask) in bit_positions(item) {
            self.0[byte] |= mask;
        }
    }

    pub fn contains_bytes(&self, item: &[u8]) -> bool {
        bit_positions(item)
            .iter()
            .all(|&(byte, mask)| self.0[byte] & mask == mask)
    }

    /// `containsAddress(bloom, address)`; malformed hex never matches.
    pub fn contains_address(&self, address: &str) -> bool {
        decode_fixed::<20>(address).is_some_and(|a| self.contains_bytes(&a))
    }

    /// `containsTopic(bloom, topic)`; malformed hex never matches.
    pub fn contains_topic(&self, topic: &str) -> bool {
        decode_fixed::<32>(topic).is_some_and(|t| self.contains_bytes(&t))
    }
}

fn bit_positions(item: &[u8]) -> [(usize, u8); 3] {
    let mut hash = [0u8; 32];
    let mut keccak = Keccak::v256();
    keccak.update(item);
    keccak.finalize(&mut hash);

    let mut out = [(0usize, 0u8); 3];
    for (i, slot) in out.iter_mut().enumerate() {
        let bit = (((hash[2 * i] as usize) << 8) | hash[2 * i + 1] as usize) & 2047;
        *slot = (BLOOM_BYTES - 1 - bit / 8, 1u8 << (bit % 8));
    }
    out
}

fn decode_fixed<const N: usize>(s: &str) -> Option<[u8; N]> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s)).ok()?.try_into().ok()
}

/// Addresses and topics a consumer of the block stream cares about.
///
/// Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl LogFilter {
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.topics.is_empty()
    }

    /// Returns `true` if a block with this bloom may contain matching logs.
    pub fn may_match(&self, bloom: &Bloom) -> bool {
        let address_ok =
            self.addresses.is_empty() || self.addresses.iter().any(|a| bloom.contains_address(a));
        let topic_ok = self.topics.is_empty() || self.topics.iter().any(|t| bloom.contains_topic(t));
        address_ok && topic_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
    const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";
    const TRANSFER: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

    fn bloom_with(address: &str, topic: &str) -> Bloom {
        let mut bloom = Bloom::empty();
        bloom.accrue(&hex::decode(&address[2..]).unwrap());
        bloom.accrue(&hex::decode(&topic[2..]).unwrap());
        bloom
    }

    #[test]
    fn contains_accrued_items() {
        let bloom = bloom_with(USDC, TRANSFER);
        assert!(bloom.contains_address(USDC));
        assert!(bloom.contains_topic(TRANSFER));
        assert!(!bloom.contains_address(WETH));
    }

    #[test]
    fn empty_bloom_contains_nothing() {
        let bloom = Bloom::empty();
        assert!(!bloom.contains_address(USDC));
        assert!(!bloom.contains_topic(TRANSFER));
    }

    #[test]
    fn hex_roundtrip_and_length_check() {
        let bloom = bloom_with(USDC, TRANSFER);
        assert_eq!(Bloom::from_hex(&bloom.to_hex()).unwrap(), bloom);
        assert!(Bloom::from_hex("0x1234").is_err());
        assert!(Bloom::from_hex("0xzz").is_err());
    }

    #[test]
    fn filter_prechecks_bloom() {
        let bloom = bloom_with(USDC, TRANSFER);
        assert!(LogFilter::default().may_match(&bloom));

        let usdc = LogFilter { addresses: vec![USDC.into()], topics: vec![] };
        assert!(usdc.may_match(&bloom));

        let weth = LogFilter { addresses: vec![WETH.into()], topics: vec![TRANSFER.into()] };
        assert!(!weth.may_match(&bloom));
    }

    #[test]
    fn malformed_inputs_never_match() {
        let bloom = bloom_with(USDC, TRANSFER);
        assert!(!bloom.contains_address("0x1234"));
        assert!(!bloom.contains_topic("not-hex"));
    }
}
