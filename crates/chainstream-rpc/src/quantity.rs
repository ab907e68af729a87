//! Hex quantity decoding (`"0x1b4"` → `436`).

use serde::{Deserialize, Deserializer};

use chainstream_core::StreamError;

/// Parse a hex quantity, with or without `0x`.
pub fn parse_quantity(s: &str) -> Result<u64, StreamError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Err(StreamError::protocol(format!("empty hex quantity '{s}'")));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| StreamError::protocol(format!("invalid hex quantity '{s}'")).with_cause(e))
}

/// A `u64` that deserializes from a JSON-RPC hex quantity string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantity(pub u64);

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_quantity(&s)
            .map(Quantity)
            .map_err(|e| serde::de::Error::custom(e.message().to_string()))
    }
}
