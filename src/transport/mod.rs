//! # Transport Cache
//!
//! Keyed cache of preconfigured HTTP clients, one per (fanout, endpoint).
//! Each transport has the endpoint's TLS material and timeout baked in so
//! dispatch reuses warm connection pools instead of re-handshaking.
//!
//! Concurrency policy: reads take the shared lock; a miss builds the
//! transport outside any lock and double-checks under the write lock, so
//! the first insert wins and both contenders observe the same transport.

use crate::model::{Endpoint, FanoutKey, HttpEndpoint, ModelError, KEY_SEPARATOR};
use parking_lot::RwLock;
use reqwest::{Certificate, Client, Identity};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transport construction errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Fanout or endpoint name failed validation
    #[error("invalid transport key: {0}")]
    InvalidKey(#[from] ModelError),

    /// `ca_pem` did not parse as a PEM certificate set
    #[error("failed to parse root certificate for {0:?}: {1}")]
    InvalidRootCertificate(String, String),

    /// `ca_pem`/`key_pem` did not load as a client key pair
    #[error("failed to load client key pair for {0:?}: {1}")]
    InvalidKeyPair(String, String),

    /// The HTTP client could not be assembled
    #[error("failed to build HTTP client for {0:?}: {1}")]
    ClientBuild(String, String),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport cache configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-request timeout applied when an endpoint sets `timeout_ms = 0`.
    /// A zero duration disables the client-level deadline.
    pub default_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(15),
        }
    }
}

/// A prepared outbound HTTP transport.
///
/// Immutable after construction; safe to share across concurrent requests.
#[derive(Debug)]
pub struct Transport {
    client: Client,
    timeout: Duration,
}

impl Transport {
    /// The underlying HTTP client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The per-request timeout baked into the client; zero means no
    /// client-level deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Cache of per-(fanout, endpoint) transports
pub struct TransportCache {
    /// Configuration
    config: TransportConfig,

    /// Key (`fanout:endpoint`) to transport map
    transports: RwLock<HashMap<String, Arc<Transport>>>,
}

impl TransportCache {
    /// Create an empty cache.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            transports: RwLock::new(HashMap::new()),
        }
    }

    /// Return the transport for the endpoint, building it on first use.
    pub fn get(&self, fanout: &str, endpoint: &Endpoint) -> Result<Arc<Transport>> {
        let key = FanoutKey::new(fanout, &endpoint.name)?.to_string();

        if let Some(transport) = self.transports.read().get(&key) {
            return Ok(transport.clone());
        }

        let built = Arc::new(self.build(&key, endpoint.http())?);

        let mut transports = self.transports.write();
        if let Some(existing) = transports.get(&key) {
            // Lost the race; the stored transport wins.
            return Ok(existing.clone());
        }
        transports.insert(key, built.clone());
        Ok(built)
    }

    /// Drop the entry for the endpoint; the next `get` rebuilds it.
    pub fn invalidate(&self, fanout: &str, endpoint_name: &str) {
        let key = format!("{}{}{}", fanout, KEY_SEPARATOR, endpoint_name);
        self.transports.write().remove(&key);
    }

    /// Number of cached transports.
    pub fn len(&self) -> usize {
        self.transports.read().len()
    }

    /// Whether the cache holds no transports.
    pub fn is_empty(&self) -> bool {
        self.transports.read().is_empty()
    }

    fn build(&self, key: &str, http: &HttpEndpoint) -> Result<Transport> {
        let timeout = if http.timeout_ms > 0 {
            Duration::from_millis(http.timeout_ms)
        } else {
            self.config.default_timeout
        };

        let mut builder = Client::builder();
        if !timeout.is_zero() {
            builder = builder.timeout(timeout);
        }

        if let Some(tls) = &http.tls {
            if let Some(ca_pem) = &tls.ca_pem {
                let roots = Certificate::from_pem(ca_pem.as_bytes()).map_err(|e| {
                    TransportError::InvalidRootCertificate(key.to_string(), e.to_string())
                })?;
                builder = builder.add_root_certificate(roots);

                if let Some(key_pem) = &tls.key_pem {
                    let identity = Identity::from_pkcs8_pem(ca_pem.as_bytes(), key_pem.as_bytes())
                        .map_err(|e| {
                            TransportError::InvalidKeyPair(key.to_string(), e.to_string())
                        })?;
                    builder = builder.identity(identity);
                }
            }
            if tls.insecure_skip_verify {
                builder = builder.danger_accept_invalid_certs(true);
            }
            if !tls.server_name.is_empty() {
                // reqwest has no per-client SNI override; an explicit server
                // name means the URL host will not match the presented
                // certificate, so hostname verification is relaxed while
                // chain verification against the installed roots remains.
                builder = builder.danger_accept_invalid_hostnames(true);
            }
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::ClientBuild(key.to_string(), e.to_string()))?;

        Ok(Transport { client, timeout })
    }
}
