//! Endpoint failover client.
//!
//! Endpoints are walked in order: primaries as configured, then the
//! alternate. The current endpoint is retried with exponential backoff up to
//! the retry limit; once exhausted the client rotates to the next endpoint.
//! When every endpoint is exhausted the caller gets one fatal
//! `NoEndpointAvailable` error.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chainstream_core::StreamError;

use crate::http::HttpTransport;
use crate::quantity::Quantity;
use crate::request::{JsonRpcRequest, RpcId};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::transport::RpcTransport;

/// Where an endpoint sits in the failover order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    Primary,
    Alternate,
}

/// Per-endpoint health snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointHealth {
    pub url: String,
    pub role: EndpointRole,
    pub consecutive_failures: u32,
    /// `true` for the endpoint the next request starts on.
    pub current: bool,
}

/// Configuration for [`FailoverClient`].
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub retry: RetryConfig,
    /// Upper bound on a single attempt.
    pub rpc_timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

/// Block selector for `eth_getBlockBy*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockId {
    Number(u64),
    Hash(String),
    Latest,
}

impl BlockId {
    fn method(&self) -> &'static str {
        match self {
            Self::Hash(_) => "eth_getBlockByHash",
            _ => "eth_getBlockByNumber",
        }
    }

    fn param(&self) -> Value {
        match self {
            Self::Number(n) => Value::String(format!("0x{n:x}")),
            Self::Hash(h) => Value::String(h.clone()),
            Self::Latest => Value::String("latest".into()),
        }
    }
}

struct Endpoint {
    transport: Arc<dyn RpcTransport>,
    role: EndpointRole,
    consecutive_failures: AtomicU32,
}

/// JSON-RPC client over an ordered set of endpoints.
pub struct FailoverClient {
    endpoints: Vec<Endpoint>,
    current: AtomicUsize,
    next_id: AtomicU64,
    retry: RetryPolicy,
    rpc_timeout: Duration,
}

impl FailoverClient {
    /// Build a client from primaries (in order) and an optional alternate.
    pub fn new(
        primaries: Vec<Arc<dyn RpcTransport>>,
        alternate: Option<Arc<dyn RpcTransport>>,
        config: FailoverConfig,
    ) -> Result<Self, StreamError> {
        let endpoints: Vec<Endpoint> = primaries
            .into_iter()
            .map(|t| (t, EndpointRole::Primary))
            .chain(alternate.map(|t| (t, EndpointRole::Alternate)))
            .map(|(transport, role)| Endpoint {
                transport,
                role,
                consecutive_failures: AtomicU32::new(0),
            })
            .collect();

        if endpoints.is_empty() {
            return Err(StreamError::configuration("at least one RPC endpoint is required"));
        }

        Ok(Self {
            endpoints,
            current: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            retry: RetryPolicy::new(config.retry),
            rpc_timeout: config.rpc_timeout,
        })
    }

    /// Build a client over HTTP endpoints.
    pub fn from_urls(
        primaries: &[String],
        alternate: Option<&str>,
        config: FailoverConfig,
    ) -> Result<Self, StreamError> {
        let build = |url: &str| -> Result<Arc<dyn RpcTransport>, StreamError> {
            let transport = HttpTransport::new(url, config.rpc_timeout).map_err(|e| {
                StreamError::configuration(format!("cannot build transport for {url}")).with_cause(e)
            })?;
            Ok(Arc::new(transport))
        };
        let primaries = primaries
            .iter()
            .map(|u| build(u))
            .collect::<Result<Vec<_>, _>>()?;
        let alternate = alternate.map(build).transpose()?;
        Self::new(primaries, alternate, config)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoint_health(&self) -> Vec<EndpointHealth> {
        let current = self.current.load(Ordering::Relaxed) % self.endpoints.len();
        self.endpoints
            .iter()
            .enumerate()
            .map(|(i, e)| EndpointHealth {
                url: e.transport.url().to_string(),
                role: e.role,
                consecutive_failures: e.consecutive_failures.load(Ordering::Relaxed),
                current: i == current,
            })
            .collect()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `op` against the endpoints until one succeeds or all are exhausted.
    async fn execute<T, F, Fut>(&self, label: &str, op: F) -> Result<T, StreamError>
    where
        F: Fn(Arc<dyn RpcTransport>) -> Fut,
        Fut: Future<Output = Result<T, StreamError>>,
    {
        let n = self.endpoints.len();
        let start = self.current.load(Ordering::Relaxed) % n;
        let timeout_ms = self.rpc_timeout.as_millis() as u64;

        for step in 0..n {
            let idx = (start + step) % n;
            let endpoint = &self.endpoints[idx];
            let url = endpoint.transport.url();
            let mut attempt = 0u32;

            loop {
                attempt += 1;
                let outcome =
                    match tokio::time::timeout(self.rpc_timeout, op(Arc::clone(&endpoint.transport))).await {
                        Ok(result) => result,
                        Err(_) => Err(StreamError::transient(format!(
                            "{label} timed out after {timeout_ms}ms"
                        ))),
                    };

                match outcome {
                    Ok(value) => {
                        endpoint.consecutive_failures.store(0, Ordering::Relaxed);
                        self.current.store(idx, Ordering::Relaxed);
                        return Ok(value);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        endpoint.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                        match self.retry.next_delay(attempt) {
                            Some(delay) => {
                                tracing::warn!(
                                    endpoint = %url,
                                    attempt,
                                    delay_ms = delay.as_millis() as u64,
                                    error = %e,
                                    "{label} failed, retrying"
                                );
                                tokio::time::sleep(delay).await;
                            }
                            None => {
                                tracing::warn!(
                                    endpoint = %url,
                                    attempt,
                                    error = %e,
                                    "{label} exhausted retries on endpoint"
                                );
                                break;
                            }
                        }
                    }
                }
            }

            let next = (idx + 1) % n;
            self.current.store(next, Ordering::Relaxed);
            if step + 1 < n {
                tracing::warn!(
                    from = %url,
                    to = %self.endpoints[next].transport.url(),
                    role = ?self.endpoints[next].role,
                    "rotating to next endpoint"
                );
            }
        }

        tracing::error!(endpoints = n, "{label}: no endpoint available");
        Err(StreamError::no_endpoint_available(n))
    }

    /// Call `method` and decode its result as `T`.
    ///
    /// A provider error object or an undecodable result is retried like a
    /// transport failure.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, StreamError> {
        self.execute(method, |transport| {
            let req = JsonRpcRequest::new(self.next_id(), method, params.clone());
            async move {
                let resp = transport.send(req).await?;
                let value = resp.into_result().map_err(|e| {
                    StreamError::protocol(format!("{method}: {e}")).with_cause(e)
                })?;
                serde_json::from_value(value).map_err(|e| {
                    StreamError::protocol(format!("{method}: malformed result")).with_cause(e)
                })
            }
        })
        .await
    }

    /// Send several calls in one round trip; results are returned in call order.
    pub async fn batch(&self, calls: &[(&str, Vec<Value>)]) -> Result<Vec<Value>, StreamError> {
        self.execute("batch", |transport| {
            let reqs: Vec<JsonRpcRequest> = calls
                .iter()
                .map(|(method, params)| JsonRpcRequest::new(self.next_id(), *method, params.clone()))
                .collect();
            async move {
                let ids: Vec<RpcId> = reqs.iter().map(|r| r.id.clone()).collect();
                let mut responses = transport.send_batch(reqs).await?;
                let mut out = Vec::with_capacity(ids.len());
                for id in &ids {
                    let pos = responses
                        .iter()
                        .position(|r| &r.id == id)
                        .ok_or_else(|| StreamError::protocol(format!("batch response missing id {id}")))?;
                    let resp = responses.swap_remove(pos);
                    out.push(resp.into_result().map_err(|e| {
                        StreamError::protocol(format!("batch item {id}: {e}")).with_cause(e)
                    })?);
                }
                Ok(out)
            }
        })
        .await
    }

    /// `eth_blockNumber`.
    pub async fn get_latest_block_number(&self) -> Result<u64, StreamError> {
        let Quantity(n) = self.request("eth_blockNumber", vec![]).await?;
        Ok(n)
    }

    /// `eth_getBlockByNumber` / `eth_getBlockByHash`; `None` if the node has no such block.
    pub async fn get_block(
        &self,
        id: BlockId,
        include_transactions: bool,
    ) -> Result<Option<Value>, StreamError> {
        self.request(id.method(), vec![id.param(), json!(include_transactions)])
            .await
    }

    /// `eth_getBlockReceipts` for a block number.
    pub async fn get_block_receipts(&self, number: u64) -> Result<Option<Value>, StreamError> {
        self.request("eth_getBlockReceipts", vec![BlockId::Number(number).param()])
            .await
    }

    /// Block and its receipts in a single batched round trip.
    pub async fn get_block_with_receipts(
        &self,
        number: u64,
        include_transactions: bool,
    ) -> Result<(Option<Value>, Option<Value>), StreamError> {
        let id = BlockId::Number(number);
        let mut results = self
            .batch(&[
                (id.method(), vec![id.param(), json!(include_transactions)]),
                ("eth_getBlockReceipts", vec![id.param()]),
            ])
            .await?;
        let receipts = results.pop().filter(|v| !v.is_null());
        let block = results.pop().filter(|v| !v.is_null());
        Ok((block, receipts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::request::JsonRpcResponse;
    use async_trait::async_trait;
    use chainstream_core::ErrorKind;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(u32, &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> + Send + Sync>;

    struct MockTransport {
        url: String,
        calls: Mutex<u32>,
        respond: Responder,
        delay: Option<Duration>,
    }

    impl MockTransport {
        fn new(url: &str, respond: Responder) -> Arc<Self> {
            Arc::new(Self { url: url.into(), calls: Mutex::new(0), respond, delay: None })
        }

        fn slow(url: &str, delay: Duration, respond: Responder) -> Arc<Self> {
            Arc::new(Self { url: url.into(), calls: Mutex::new(0), respond, delay: Some(delay) })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl RpcTransport for MockTransport {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            (self.respond)(n, &req)
        }

        fn url(&self) -> &str {
            &self.url
        }
    }

    fn id_of(req: &JsonRpcRequest) -> u64 {
        match req.id {
            RpcId::Number(n) => n,
            _ => 0,
        }
    }

    fn ok_number(hex: &'static str) -> Responder {
        Box::new(move |_, req| Ok(JsonRpcResponse::success(id_of(req), json!(hex))))
    }

    fn config(max_retries: u32) -> FailoverConfig {
        FailoverConfig {
            retry: RetryConfig {
                max_retries,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                multiplier: 2.0,
            },
            rpc_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn retries_same_endpoint_before_rotating() {
        let a = MockTransport::new(
            "a",
            Box::new(|n, req| {
                if n < 3 {
                    Err(TransportError::Http("connection reset".into()))
                } else {
                    Ok(JsonRpcResponse::success(id_of(req), json!("0x64")))
                }
            }),
        );
        let b = MockTransport::new("b", ok_number("0x1"));
        let client = FailoverClient::new(vec![a.clone(), b.clone()], None, config(3)).unwrap();

        assert_eq!(client.get_latest_block_number().await.unwrap(), 100);
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn provider_error_is_retried_then_rotated() {
        let a = MockTransport::new(
            "a",
            Box::new(|_, req| Ok(JsonRpcResponse::failure(id_of(req), -32005, "limit exceeded"))),
        );
        let b = MockTransport::new("b", ok_number("0x2a"));
        let client = FailoverClient::new(vec![a.clone()], Some(b.clone()), config(2)).unwrap();

        assert_eq!(client.get_latest_block_number().await.unwrap(), 42);
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 1);

        // The rotated endpoint stays current for the next request.
        assert_eq!(client.get_latest_block_number().await.unwrap(), 42);
        assert_eq!(a.calls(), 3);
        let health = client.endpoint_health();
        assert!(health[1].current);
        assert_eq!(health[1].role, EndpointRole::Alternate);
        assert_eq!(health[0].consecutive_failures, 3);
    }

    #[tokio::test]
    async fn malformed_result_is_retryable() {
        let a = MockTransport::new(
            "a",
            Box::new(|_, req| Ok(JsonRpcResponse::success(id_of(req), json!("0xzz")))),
        );
        let b = MockTransport::new("b", ok_number("0x10"));
        let client = FailoverClient::new(vec![a.clone(), b], None, config(0)).unwrap();
        assert_eq!(client.get_latest_block_number().await.unwrap(), 16);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let a = MockTransport::slow("a", Duration::from_secs(5), ok_number("0x1"));
        let b = MockTransport::new("b", ok_number("0x2"));
        let client = FailoverClient::new(vec![a, b], None, config(0)).unwrap();
        assert_eq!(client.get_latest_block_number().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn all_endpoints_exhausted_is_fatal() {
        let fail: fn() -> Responder = || Box::new(|_, _| Err(TransportError::Http("refused".into())));
        let a = MockTransport::new("a", fail());
        let alt = MockTransport::new("alt", fail());
        let client = FailoverClient::new(vec![a.clone()], Some(alt.clone()), config(1)).unwrap();

        let err = client.get_latest_block_number().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoEndpointAvailable);
        assert!(err.is_fatal());
        assert_eq!(a.calls(), 2);
        assert_eq!(alt.calls(), 2);
    }

    #[tokio::test]
    async fn batch_results_follow_call_order() {
        let a = MockTransport::new(
            "a",
            Box::new(|_, req| {
                let result = match req.method.as_str() {
                    "eth_getBlockByNumber" => json!({"number": "0x1"}),
                    "eth_getBlockReceipts" => json!([]),
                    _ => Value::Null,
                };
                Ok(JsonRpcResponse::success(id_of(req), result))
            }),
        );
        let client = FailoverClient::new(vec![a], None, config(0)).unwrap();
        let (block, receipts) = client.get_block_with_receipts(1, true).await.unwrap();
        assert_eq!(block.unwrap()["number"], "0x1");
        assert_eq!(receipts.unwrap(), json!([]));
    }

    #[test]
    fn empty_endpoint_set_rejected() {
        let err = FailoverClient::new(vec![], None, FailoverConfig::default()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn block_id_params() {
        assert_eq!(BlockId::Number(255).param(), json!("0xff"));
        assert_eq!(BlockId::Hash("0xabc".into()).method(), "eth_getBlockByHash");
        assert_eq!(BlockId::Latest.param(), json!("latest"));
    }
}
