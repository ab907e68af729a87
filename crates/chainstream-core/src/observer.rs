//! The observer capability consumed at the block-delivery boundary and at
//! the message-consumption boundary.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ErrorKind, StreamError};

/// Receives the items of a stream one at a time.
///
/// The producing instance awaits `next` before delivering the following
/// item, so a slow `next` is the backpressure signal.
#[async_trait]
pub trait Observer<T: Send + 'static>: Send + Sync {
    /// Deliver one item. An `Err` is treated as a delivery failure.
    async fn next(&self, value: T) -> Result<(), StreamError>;

    /// Called once with the error that stopped the instance.
    async fn error(&self, _error: &StreamError) {}

    /// Called once when the instance stops, after `error` if there was one.
    async fn closed(&self) {}
}

/// What a [`ChannelObserver`] forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification<T> {
    Next(T),
    Error { kind: ErrorKind, message: String },
    Closed,
}

/// Forwards every notification into a bounded channel.
///
/// `next` waits for channel capacity, so the receiving side controls the pace.
pub struct ChannelObserver<T> {
    tx: mpsc::Sender<Notification<T>>,
}

impl<T: Send + 'static> ChannelObserver<T> {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification<T>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl<T: Send + 'static> Observer<T> for ChannelObserver<T> {
    async fn next(&self, value: T) -> Result<(), StreamError> {
        self.tx
            .send(Notification::Next(value))
            .await
            .map_err(|_| StreamError::handler("observer channel closed"))
    }

    async fn error(&self, error: &StreamError) {
        let _ = self
            .tx
            .send(Notification::Error {
                kind: error.kind(),
                message: error.message().to_string(),
            })
            .await;
    }

    async fn closed(&self) {
        let _ = self.tx.send(Notification::Closed).await;
    }
}
