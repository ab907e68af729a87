//! Transport-level error types.

use chainstream_core::StreamError;
use thiserror::Error;

/// Errors raised by a single transport round trip.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, reset, non-2xx status).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response body could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for StreamError {
    fn from(e: TransportError) -> Self {
        let message = e.to_string();
        match e {
            TransportError::Deserialization(_) => StreamError::protocol(message).with_cause(e),
            _ => StreamError::transient(message).with_cause(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainstream_core::ErrorKind;

    #[test]
    fn transport_errors_map_to_taxonomy() {
        let e: StreamError = TransportError::Timeout { ms: 500 }.into();
        assert_eq!(e.kind(), ErrorKind::TransientNetwork);
        assert!(e.is_retryable());

        let bad = serde_json::from_str::<u64>("{").unwrap_err();
        let e: StreamError = TransportError::Deserialization(bad).into();
        assert_eq!(e.kind(), ErrorKind::Protocol);
        assert!(e.is_retryable());
    }
}
