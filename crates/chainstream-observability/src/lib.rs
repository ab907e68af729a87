//! chainstream-observability: structured logging for ChainStream processes.
//!
//! Every ChainStream crate logs through `tracing` with structured fields
//! (`block`, `depth`, `endpoint`, `attempt`, `topic`, `offset`). This crate
//! installs the subscriber: an `EnvFilter` built from a global level plus
//! per-crate overrides, and text or JSON output.
//!
//! ```no_run
//! use chainstream_observability::{init_tracing, LogConfig};
//!
//! init_tracing(&LogConfig { json: true, ..LogConfig::default() }.component("chainstream-producer", "debug"));
//! ```

pub mod tracing_setup;

pub use tracing_setup::{build_directives, init_tracing, LogConfig};
