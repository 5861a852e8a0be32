//! # Fanout Data Model
//!
//! Core types shared by the store, the caches, and the dispatch engine:
//! - `Endpoint` and its `Destination` variants
//! - `HttpEndpoint` with per-endpoint headers, timeout and TLS material
//! - `FanoutKey` for keying transports per (fanout, endpoint)
//! - Name validation (`:` is reserved as the key separator)

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Separator used when serialising a `FanoutKey`; rejected in names.
pub const KEY_SEPARATOR: char = ':';

/// Model validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Empty fanout or endpoint name
    #[error("name must not be empty")]
    EmptyName,

    /// Name contains the reserved key separator
    #[error("name {0:?} contains reserved character ':'")]
    ReservedCharacter(String),
}

/// Result type for model validation
pub type Result<T> = std::result::Result<T, ModelError>;

/// Validate a fanout or endpoint name.
///
/// Names must be non-empty and must not contain `:`, which is reserved
/// as the transport-cache key separator.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ModelError::EmptyName);
    }
    if name.contains(KEY_SEPARATOR) {
        return Err(ModelError::ReservedCharacter(name.to_string()));
    }
    Ok(())
}

/// One endpoint of a fanout.
///
/// Exactly one endpoint per fanout is primary; the store enforces this
/// at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint name, unique within its fanout
    pub name: String,

    /// Whether this endpoint's response is relayed to the caller
    #[serde(default)]
    pub primary: bool,

    /// Where requests to this endpoint go
    pub destination: Destination,
}

impl Endpoint {
    /// The HTTP descriptor of this endpoint.
    pub fn http(&self) -> &HttpEndpoint {
        match &self.destination {
            Destination::Http(http) => http,
        }
    }
}

/// Destination of an endpoint.
///
/// Modelled as an open sum so future destination kinds (gRPC, queues)
/// are additive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Destination {
    /// Plain HTTP(S) endpoint
    Http(HttpEndpoint),
}

/// HTTP destination descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpEndpoint {
    /// Absolute URL requests are sent to
    pub url: String,

    /// HTTP verb used for outbound calls
    pub method: String,

    /// Headers applied to outbound calls, appended after the inbound
    /// copy. Keys may repeat across entries and each entry may carry
    /// multiple values.
    #[serde(default)]
    pub headers: Vec<HeaderPair>,

    /// Per-call timeout in milliseconds; 0 uses the engine default
    #[serde(default)]
    pub timeout_ms: u64,

    /// Optional TLS configuration for the outbound transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,
}

/// One outbound header entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderPair {
    /// Header key
    pub key: String,

    /// Values added under the key
    pub values: Vec<String>,
}

/// TLS material and overrides for an endpoint's transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Expected server name when it differs from the URL host
    #[serde(default)]
    pub server_name: String,

    /// Skip certificate verification entirely
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// PEM-encoded root certificate set; when present it is also used
    /// as the client certificate paired with `key_pem`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_pem: Option<String>,

    /// PEM-encoded client key paired with `ca_pem`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pem: Option<String>,
}

/// Composite key identifying an endpoint within a fanout.
///
/// Serialised as `fanout:endpoint`; both components reject `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FanoutKey {
    /// Fanout name
    pub fanout: String,

    /// Endpoint name
    pub endpoint: String,
}

impl FanoutKey {
    /// Build a key, validating both components.
    pub fn new(fanout: &str, endpoint: &str) -> Result<Self> {
        validate_name(fanout)?;
        validate_name(endpoint)?;
        Ok(Self {
            fanout: fanout.to_string(),
            endpoint: endpoint.to_string(),
        })
    }
}

impl fmt::Display for FanoutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.fanout, KEY_SEPARATOR, self.endpoint)
    }
}
