//! chainstream-rpc: the chain-facing half of ChainStream.
//!
//! # Overview
//!
//! - [`RpcTransport`]: one endpoint, one round trip; [`HttpTransport`] over `reqwest`
//! - [`FailoverClient`]: retry on the current endpoint, then rotate through
//!   primaries and the alternate; one fatal error when all are exhausted
//! - [`BlockSource`]: head number + full block, standard or batched-receipts
//! - [`HeaderSubscription`]: pushed headers over `eth_subscribe("newHeads")`

pub mod error;
pub mod failover;
pub mod http;
pub mod quantity;
pub mod request;
pub mod retry;
pub mod source;
pub mod subscription;
pub mod transport;

pub use error::TransportError;
pub use failover::{BlockId, EndpointHealth, EndpointRole, FailoverClient, FailoverConfig};
pub use http::HttpTransport;
pub use quantity::{parse_quantity, Quantity};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use retry::{RetryConfig, RetryPolicy};
pub use source::{BlockSource, FetchMode, RpcBlockSource, SourceOptions};
pub use subscription::{HeaderSubscription, WsHeaderSubscription};
pub use transport::RpcTransport;
