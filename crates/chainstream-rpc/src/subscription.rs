//! Push-based header discovery.
//!
//! A subscription hands headers to the producer through a bounded channel.
//! When the connection drops, the channel closes and the producer decides
//! whether to resubscribe.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use chainstream_core::{BlockHeader, StreamError};

use crate::error::TransportError;
use crate::quantity::parse_quantity;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// A source of pushed block headers.
#[async_trait]
pub trait HeaderSubscription: Send + Sync + 'static {
    /// Establish a fresh subscription. Dropping the receiver tears it down.
    async fn subscribe(&self) -> Result<mpsc::Receiver<BlockHeader>, StreamError>;
}

/// `eth_subscribe("newHeads")` over a WebSocket endpoint.
pub struct WsHeaderSubscription {
    url: String,
    buffer: usize,
    handshake_timeout: Duration,
}

impl WsHeaderSubscription {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            buffer: 64,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Channel capacity between the socket reader and the producer.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl HeaderSubscription for WsHeaderSubscription {
    async fn subscribe(&self) -> Result<mpsc::Receiver<BlockHeader>, StreamError> {
        let ms = self.handshake_timeout.as_millis() as u64;
        let (ws, _) = tokio::time::timeout(self.handshake_timeout, tokio_tungstenite::connect_async(&self.url))
            .await
            .map_err(|_| TransportError::Timeout { ms })?
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let req = JsonRpcRequest::new(1, "eth_subscribe", vec![json!("newHeads")]);
        let text = serde_json::to_string(&req).map_err(TransportError::from)?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        let sub_id = tokio::time::timeout(self.handshake_timeout, await_subscription_id(&mut stream))
            .await
            .map_err(|_| StreamError::from(TransportError::Timeout { ms }))??;

        tracing::info!(url = %self.url, subscription = %sub_id, "subscribed to newHeads");

        let (tx, rx) = mpsc::channel(self.buffer);
        let url = self.url.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let Some(header) = header_notification(text.as_str(), &sub_id) else {
                                continue;
                            };
                            if tx.send(header).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            tracing::warn!(url = %url, error = %e, "newHeads stream error");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
            let _ = sink.close().await;
            tracing::debug!(url = %url, "newHeads reader stopped");
        });

        Ok(rx)
    }
}

/// Read until the `eth_subscribe` response arrives and return the subscription id.
async fn await_subscription_id<S>(stream: &mut S) -> Result<String, StreamError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        let msg = msg.map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let Message::Text(text) = msg else { continue };
        let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(text.as_str()) else {
            continue;
        };
        let result = resp
            .into_result()
            .map_err(|e| StreamError::protocol(format!("eth_subscribe rejected: {e}")))?;
        return result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StreamError::protocol("eth_subscribe returned no id"));
    }
    Err(TransportError::WebSocket("closed during subscribe".into()).into())
}

/// Extract the header from an `eth_subscription` notification for `sub_id`.
fn header_notification(text: &str, sub_id: &str) -> Option<BlockHeader> {
    let val: Value = serde_json::from_str(text).ok()?;
    if val["method"].as_str() != Some("eth_subscription") {
        return None;
    }
    let params = &val["params"];
    if params["subscription"].as_str() != Some(sub_id) {
        return None;
    }
    match header_from_json(&params["result"]) {
        Ok(h) => Some(h),
        Err(e) => {
            tracing::debug!(error = %e, "dropping malformed header");
            None
        }
    }
}

/// Convert a `newHeads` payload into a [`BlockHeader`].
pub fn header_from_json(v: &Value) -> Result<BlockHeader, StreamError> {
    let field = |name: &str| {
        v[name]
            .as_str()
            .ok_or_else(|| StreamError::protocol(format!("header missing '{name}'")))
    };
    Ok(BlockHeader {
        number: parse_quantity(field("number")?)?,
        hash: field("hash")?.to_string(),
        parent_hash: field("parentHash")?.to_string(),
        timestamp: parse_quantity(field("timestamp")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFICATION: &str = r#"{
        "jsonrpc": "2.0",
        "method": "eth_subscription",
        "params": {
            "subscription": "0x9ce59a13059e417087c02d3236a0b1cc",
            "result": {"number": "0x1b4", "hash": "0xaa", "parentHash": "0xbb", "timestamp": "0x5"}
        }
    }"#;

    #[test]
    fn parses_matching_notification() {
        let h = header_notification(NOTIFICATION, "0x9ce59a13059e417087c02d3236a0b1cc").unwrap();
        assert_eq!(h.number, 436);
        assert_eq!(h.parent_hash, "0xbb");
    }

    #[test]
    fn ignores_other_subscriptions() {
        assert!(header_notification(NOTIFICATION, "0xother").is_none());
        assert!(header_notification(r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#, "0x1").is_none());
    }

    #[test]
    fn malformed_header_is_protocol_error() {
        let err = header_from_json(&json!({"number": "0x1"})).unwrap_err();
        assert_eq!(err.kind(), chainstream_core::ErrorKind::Protocol);
    }
}
