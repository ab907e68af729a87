//! Error taxonomy for the block producer and the streaming pipeline.
//!
//! Every failure is a single [`StreamError`] tagged with an [`ErrorKind`].
//! Propagation logic switches on the kind; `fatal` records whether the
//! owning instance may retry internally or must stop.

use std::fmt;

use thiserror::Error;

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeout, connection reset, refused connection.
    TransientNetwork,
    /// Malformed response or a provider error object.
    Protocol,
    /// No common ancestor within the configured reorg depth.
    ReorgDepthExceeded,
    /// A push subscription went silent past its liveness timeout.
    SubscriptionLiveness,
    /// A coder failed to serialize or deserialize a message.
    Serialization,
    /// No delivery acknowledgement before the delivery timeout.
    DeliveryTimeout,
    /// Every configured endpoint exhausted its retry budget.
    NoEndpointAvailable,
    /// Invalid or unresolvable configuration.
    Configuration,
    /// The application observer rejected an item.
    Handler,
    /// The instance was stopped.
    Stopped,
}

impl ErrorKind {
    /// Whether errors of this kind are fatal unless stated otherwise.
    pub fn default_fatal(self) -> bool {
        matches!(
            self,
            Self::ReorgDepthExceeded
                | Self::DeliveryTimeout
                | Self::NoEndpointAvailable
                | Self::Configuration
                | Self::Stopped
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TransientNetwork => "transient network error",
            Self::Protocol => "protocol error",
            Self::ReorgDepthExceeded => "reorg depth exceeded",
            Self::SubscriptionLiveness => "subscription liveness failure",
            Self::Serialization => "serialization error",
            Self::DeliveryTimeout => "delivery timeout",
            Self::NoEndpointAvailable => "no endpoint available",
            Self::Configuration => "configuration error",
            Self::Handler => "handler error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// The single error type shared by every ChainStream crate.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct StreamError {
    kind: ErrorKind,
    fatal: bool,
    message: String,
    #[source]
    cause: Option<Cause>,
}

impl StreamError {
    /// Create an error of `kind` with the kind's default fatality.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            fatal: kind.default_fatal(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attach an underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Override the fatality (e.g. a recoverable kind whose retries ran out).
    pub fn into_fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientNetwork, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Handler, message)
    }

    pub fn liveness(timeout_ms: u64) -> Self {
        Self::new(
            ErrorKind::SubscriptionLiveness,
            format!("no header received within {timeout_ms}ms"),
        )
    }

    pub fn delivery_timeout(topic: &str, timeout_ms: u64) -> Self {
        Self::new(
            ErrorKind::DeliveryTimeout,
            format!("no acknowledgement for topic '{topic}' within {timeout_ms}ms"),
        )
    }

    pub fn reorg_depth_exceeded(detected_at: u64, max_depth: u64) -> Self {
        Self::new(
            ErrorKind::ReorgDepthExceeded,
            format!("no common ancestor within {max_depth} blocks of block {detected_at}"),
        )
    }

    pub fn no_endpoint_available(endpoints: usize) -> Self {
        Self::new(
            ErrorKind::NoEndpointAvailable,
            format!("all {endpoints} endpoints exhausted their retries"),
        )
    }

    pub fn stopped() -> Self {
        Self::new(ErrorKind::Stopped, "instance stopped")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Returns `true` if the owning instance may retry internally.
    pub fn is_retryable(&self) -> bool {
        !self.fatal
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string()).with_cause(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_follows_taxonomy() {
        assert!(StreamError::transient("reset").is_retryable());
        assert!(StreamError::protocol("bad").is_retryable());
        assert!(StreamError::liveness(1000).is_retryable());
        assert!(StreamError::serialization("x").is_retryable());
        assert!(StreamError::reorg_depth_exceeded(106, 5).is_fatal());
        assert!(StreamError::delivery_timeout("blocks", 50).is_fatal());
        assert!(StreamError::no_endpoint_available(3).is_fatal());
    }

    #[test]
    fn exhausted_retries_become_fatal() {
        let e = StreamError::serialization("bad bytes").into_fatal();
        assert_eq!(e.kind(), ErrorKind::Serialization);
        assert!(e.is_fatal());
    }

    #[test]
    fn display_includes_kind() {
        let e = StreamError::reorg_depth_exceeded(106, 5);
        assert_eq!(
            e.to_string(),
            "reorg depth exceeded: no common ancestor within 5 blocks of block 106"
        );
    }

    #[test]
    fn serde_errors_are_serialization_kind() {
        let e: StreamError = serde_json::from_str::<u64>("nope").unwrap_err().into();
        assert_eq!(e.kind(), ErrorKind::Serialization);
        assert!(std::error::Error::source(&e).is_some());
    }
}
