//! chainstream-core: shared foundation for the reorg-safe block stream
//! and its broker pipeline.
//!
//! # Architecture
//!
//! ```text
//! FailoverClient → BlockProducer ──ChainEvent──▶ Observer
//!                                      │
//!                                      ▼
//!                 StreamingProducer → broker → StreamingConsumer → Observer
//!                          └──────── CoderRegistry ────────┘
//! ```

pub mod bloom;
pub mod coder;
pub mod error;
pub mod lifecycle;
pub mod observer;
pub mod types;

pub use bloom::{Bloom, LogFilter};
pub use coder::{BorshCoder, Coder, CoderRegistry, JsonCoder, ResolvedCoders};
pub use error::{ErrorKind, StreamError};
pub use lifecycle::Lifecycle;
pub use observer::{ChannelObserver, Notification, Observer};
pub use types::{Block, BlockHeader, BlockRef, ChainEvent, Log, Receipt, ReorgNotice, Transaction};
