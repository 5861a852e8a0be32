//! # Fanout Definition Cache
//!
//! Cluster-sharded, request-coalesced, TTL'd read-through cache over the
//! definition store. Keys map to one owning peer via consistent hashing;
//! a local miss either runs the store loader (local owner, under a
//! per-key single-flight guard) or fetches from the owner peer and holds
//! the response as a short-TTL hot copy.
//!
//! Entries are bounded by a byte budget with LRU-style eviction and
//! expire absolutely at `fill time + TTL`. There is no negative caching
//! and no push invalidation; staleness is bounded by the TTL.

use crate::model::Endpoint;
use crate::store::FanoutStore;
use crate::transport::TransportCache;
use moka::future::Cache as MokaCache;
use moka::Expiry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub mod ring;
pub mod singleflight;

pub use ring::{PeerRing, DEFAULT_VIRTUAL_NODES};
pub use singleflight::{LeaderCancelled, SingleFlight};

/// Cache load errors.
///
/// Payloads are plain strings so results clone cheaply across
/// single-flight waiters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The fanout has no endpoints (or does not exist)
    #[error("no endpoints found")]
    NoEndpoints,

    /// Store failure, surfaced verbatim
    #[error("{0}")]
    Store(String),

    /// Fetch from the owning peer failed
    #[error("peer fetch from {0} failed: {1}")]
    Peer(String, String),

    /// The coalesced load leading this key was cancelled
    #[error("coalesced load was cancelled")]
    LoadCancelled,
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Fanout cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Absolute freshness bound measured from fill time
    pub ttl: Duration,

    /// Byte budget for cached entries
    pub max_bytes: u64,

    /// Virtual nodes per peer on the hash ring
    pub virtual_nodes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_bytes: 128 << 20, // 128 MiB
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

/// One cached fanout definition
struct CachedFanout {
    /// Endpoint list as read from the store, primary-first
    endpoints: Vec<Endpoint>,

    /// Whether this is a hot copy of a remote owner's entry
    hot: bool,
}

impl CachedFanout {
    fn weight(&self) -> u32 {
        let bytes = self
            .endpoints
            .iter()
            .map(endpoint_weight)
            .sum::<usize>()
            + 64;
        bytes.min(u32::MAX as usize) as u32
    }
}

fn endpoint_weight(endpoint: &Endpoint) -> usize {
    let http = endpoint.http();
    let header_bytes: usize = http
        .headers
        .iter()
        .map(|h| h.key.len() + h.values.iter().map(String::len).sum::<usize>())
        .sum();
    let tls_bytes = http
        .tls
        .as_ref()
        .map(|t| {
            t.server_name.len()
                + t.ca_pem.as_deref().map_or(0, str::len)
                + t.key_pem.as_deref().map_or(0, str::len)
        })
        .unwrap_or(0);
    endpoint.name.len() + http.url.len() + http.method.len() + header_bytes + tls_bytes + 48
}

/// Per-entry expiry: owner entries live for the full TTL, hot copies of
/// remote entries for a quarter of it.
struct EntryExpiry {
    ttl: Duration,
}

impl Expiry<String, Arc<CachedFanout>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CachedFanout>,
        _created_at: Instant,
    ) -> Option<Duration> {
        if value.hot {
            Some(self.ttl / 4)
        } else {
            Some(self.ttl)
        }
    }
}

/// Read-through cache of fanout definitions
pub struct FanoutCache {
    ring: PeerRing,
    entries: MokaCache<String, Arc<CachedFanout>>,
    flight: SingleFlight<Result<Arc<CachedFanout>>>,
    store: Arc<dyn FanoutStore>,
    transports: Arc<TransportCache>,
    peer_client: reqwest::Client,
}

impl FanoutCache {
    /// Build the cache for this node.
    ///
    /// `self_url` is the local peer identity (`http://host:port`);
    /// `peers` is the full static peer set, which may or may not
    /// include it.
    pub fn new(
        self_url: &str,
        peers: &[String],
        store: Arc<dyn FanoutStore>,
        transports: Arc<TransportCache>,
        config: CacheConfig,
    ) -> Self {
        let entries = MokaCache::builder()
            .max_capacity(config.max_bytes)
            .weigher(|_key: &String, value: &Arc<CachedFanout>| value.weight())
            .expire_after(EntryExpiry { ttl: config.ttl })
            .build();

        Self {
            ring: PeerRing::new(self_url, peers, config.virtual_nodes),
            entries,
            flight: SingleFlight::new(),
            store,
            transports,
            peer_client: reqwest::Client::new(),
        }
    }

    /// Resolve a fanout to its endpoint list, consulting the owner peer
    /// or the store on a miss.
    pub async fn get(&self, fanout: &str) -> Result<Vec<Endpoint>> {
        if let Some(entry) = self.entries.get(fanout).await {
            return Ok(entry.endpoints.clone());
        }

        let entry = if self.ring.is_local(fanout) {
            self.load_local(fanout).await?
        } else {
            let owner = self.ring.owner(fanout).to_string();
            self.load_remote(&owner, fanout).await?
        };
        Ok(entry.endpoints.clone())
    }

    /// Resolve a fanout without consulting the ring.
    ///
    /// Serves the peer protocol: the requesting node already decided we
    /// own the key, so re-consulting a (possibly disagreeing) ring here
    /// could forward in a loop.
    pub async fn get_local(&self, fanout: &str) -> Result<Vec<Endpoint>> {
        if let Some(entry) = self.entries.get(fanout).await {
            return Ok(entry.endpoints.clone());
        }
        let entry = self.load_local(fanout).await?;
        Ok(entry.endpoints.clone())
    }

    async fn load_local(&self, fanout: &str) -> Result<Arc<CachedFanout>> {
        match self.flight.run(fanout, || self.load_from_store(fanout)).await {
            Ok(result) => result,
            Err(LeaderCancelled) => Err(CacheError::LoadCancelled),
        }
    }

    async fn load_remote(&self, owner: &str, fanout: &str) -> Result<Arc<CachedFanout>> {
        match self
            .flight
            .run(fanout, || self.fetch_from_peer(owner, fanout))
            .await
        {
            Ok(result) => result,
            Err(LeaderCancelled) => Err(CacheError::LoadCancelled),
        }
    }

    /// Loader contract: authoritative read, empty means failure, warm
    /// the transports (never fatally), install with the full TTL.
    async fn load_from_store(&self, fanout: &str) -> Result<Arc<CachedFanout>> {
        log::info!("Looking up the store for {:?}", fanout);
        let endpoints = self
            .store
            .get_fanout(fanout)
            .await
            .map_err(|e| CacheError::Store(e.to_string()))?;
        if endpoints.is_empty() {
            return Err(CacheError::NoEndpoints);
        }

        for endpoint in &endpoints {
            if let Err(err) = self.transports.get(fanout, endpoint) {
                // The endpoint is retried on dispatch; warming is best effort.
                log::warn!(
                    "Failed to warm transport for {:?}/{:?}: {}",
                    fanout,
                    endpoint.name,
                    err
                );
            }
        }

        let entry = Arc::new(CachedFanout {
            endpoints,
            hot: false,
        });
        self.entries.insert(fanout.to_string(), entry.clone()).await;
        Ok(entry)
    }

    async fn fetch_from_peer(&self, owner: &str, fanout: &str) -> Result<Arc<CachedFanout>> {
        let url = format!("{}/_groupcache/fanout/{}", owner.trim_end_matches('/'), fanout);
        log::info!("Fetching {:?} from owner {}", fanout, owner);

        let response = self
            .peer_client
            .get(url)
            .send()
            .await
            .map_err(|e| CacheError::Peer(owner.to_string(), e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.trim() == CacheError::NoEndpoints.to_string() {
                return Err(CacheError::NoEndpoints);
            }
            return Err(CacheError::Peer(
                owner.to_string(),
                format!("{}: {}", status, body.trim()),
            ));
        }

        let endpoints: Vec<Endpoint> = response
            .json()
            .await
            .map_err(|e| CacheError::Peer(owner.to_string(), e.to_string()))?;
        if endpoints.is_empty() {
            return Err(CacheError::NoEndpoints);
        }

        let entry = Arc::new(CachedFanout {
            endpoints,
            hot: true,
        });
        self.entries.insert(fanout.to_string(), entry.clone()).await;
        Ok(entry)
    }
}
