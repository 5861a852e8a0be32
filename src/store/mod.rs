//! # Definition Store
//!
//! Durable storage of fanout definitions. The read path used by the
//! fanout cache is `get_fanout`; the mutators are transactional and
//! enforce the write-time invariants:
//! - exactly one primary endpoint per fanout
//! - at most [`MAX_ENDPOINTS`] endpoints per fanout
//!
//! `PostgresStore` is the production implementation; `MemoryStore` backs
//! tests and local development without a database.

use crate::model::{Endpoint, ModelError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Maximum number of endpoints a fanout may hold.
pub const MAX_ENDPOINTS: usize = 10;

/// Store error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// Fanout or endpoint name failed validation
    #[error("invalid name: {0}")]
    InvalidName(#[from] ModelError),

    /// More endpoints than the per-fanout cap
    #[error("a maximum of {MAX_ENDPOINTS} endpoints are allowed, {0} found")]
    TooManyEndpoints(usize),

    /// Primary-count invariant violated after mutation
    #[error("need one primary endpoint; found {0}")]
    PrimaryCount(i64),

    /// Endpoint name collides within the fanout
    #[error("endpoint {0:?} already exists")]
    DuplicateEndpoint(String),

    /// Stored endpoint document failed to decode or encode
    #[error("malformed endpoint record {0:?}: {1}")]
    MalformedRecord(String, String),

    /// Underlying database failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Mutation batch applied by `update_fanout` in one transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FanoutUpdate {
    /// Endpoint names to remove
    #[serde(default)]
    pub delete: Vec<String>,

    /// Endpoints to add
    #[serde(default)]
    pub insert: Vec<Endpoint>,

    /// Endpoints to replace by name
    #[serde(default)]
    pub update: Vec<Endpoint>,
}

/// Durable fanout definition storage.
///
/// Assumed durable and linearizable per fanout name. `get_fanout`
/// returns endpoints ordered primary-first; the dispatch engine does not
/// rely on the ordering but the cache preserves it.
#[async_trait]
pub trait FanoutStore: Send + Sync {
    /// Authoritative read of a fanout's endpoints. A missing fanout
    /// yields an empty list.
    async fn get_fanout(&self, name: &str) -> Result<Vec<Endpoint>>;

    /// Create a fanout from a full endpoint set.
    async fn create_fanout(&self, name: &str, endpoints: &[Endpoint]) -> Result<()>;

    /// Apply a delete/insert/update batch to a fanout.
    async fn update_fanout(&self, name: &str, update: FanoutUpdate) -> Result<()>;

    /// Remove a fanout and all of its endpoints.
    async fn delete_fanout(&self, name: &str) -> Result<()>;
}

/// Validate a full endpoint set after mutation.
///
/// Shared by the in-memory store; the Postgres store runs the same
/// checks as `COUNT(*)` queries inside its transaction.
pub(crate) fn validate_endpoint_set(endpoints: &[Endpoint]) -> Result<()> {
    if endpoints.len() > MAX_ENDPOINTS {
        return Err(StoreError::TooManyEndpoints(endpoints.len()));
    }
    let primaries = endpoints.iter().filter(|e| e.primary).count() as i64;
    if primaries != 1 {
        return Err(StoreError::PrimaryCount(primaries));
    }
    Ok(())
}
