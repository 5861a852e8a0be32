//! # fanout - HTTP Fan-Out Proxy
//!
//! Dispatches one inbound request, in parallel, to every endpoint of a
//! named fanout and relays exactly the primary endpoint's response.
//! Non-primary endpoints are called for their side effects (dual-write,
//! shadow-read, migration verification) and their responses discarded.
//!
//! ## Architecture
//!
//! - `model`: fanout and endpoint definitions
//! - `store`: durable definition storage (Postgres, in-memory)
//! - `cache`: peer-sharded, coalesced, TTL'd definition cache
//! - `transport`: per-endpoint HTTP clients with TLS and timeouts baked in
//! - `dispatch`: the per-request parallel executor
//! - `server`: HTTP front (dispatch, peer protocol, admin, debug view)
//! - `config`: process configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

// Data model
pub mod model;

// Definition storage
pub mod store;

// Definition cache
pub mod cache;

// Outbound transports
pub mod transport;

// Dispatch engine
pub mod dispatch;

// HTTP front
pub mod server;

// Process configuration
pub mod config;

// Re-export commonly used types
pub use cache::{CacheConfig, FanoutCache};
pub use dispatch::{DispatchConfig, Dispatcher};
pub use model::{Destination, Endpoint, FanoutKey, HttpEndpoint};
pub use store::{FanoutStore, MemoryStore, PostgresStore};
pub use transport::{TransportCache, TransportConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
