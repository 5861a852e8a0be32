//! # Dispatch Engine
//!
//! Per-request concurrent executor. One inbound request fans out to one
//! task per endpoint; each task derives its own deadline, builds the
//! outbound request and executes it independently. Only the primary
//! endpoint's response is kept; everything else is drained and
//! discarded. Failures never cross task boundaries and there are no
//! retries.
//!
//! The inbound body is buffered once (capped upstream by the HTTP
//! front) and replayed to every endpoint.

use crate::cache::{CacheError, FanoutCache};
use crate::model::{Endpoint, HeaderPair};
use crate::transport::TransportCache;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

/// Cycle breadcrumb header. Set on every outbound call so a fanout
/// calling back into itself is rejected; must not be removed.
pub const FANOUT_HEADER: &str = "dfanout-fanout";

/// Request-level dispatch failures.
///
/// Per-endpoint failures are logged inside their task and never reach
/// this level; the absence of a primary response is the one exception.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Inbound request had no fanout name
    #[error("missing fanout name")]
    MissingName,

    /// The cycle breadcrumb already names this fanout
    #[error("rejected circular call")]
    CircularCall,

    /// The fanout could not be resolved
    #[error("cannot retrieve the fanout: {0}")]
    Resolve(#[from] CacheError),

    /// All tasks completed without a primary response
    #[error("timed out with no response")]
    NoPrimaryResponse,
}

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Dispatch engine configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Deadline applied to endpoints with `timeout_ms = 0`; zero means
    /// no dispatch-level deadline (the transport's client timeout still
    /// bounds the call)
    pub max_endpoint_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_endpoint_timeout: Duration::ZERO,
        }
    }
}

/// Per-request fan-out executor
pub struct Dispatcher {
    fanouts: Arc<FanoutCache>,
    transports: Arc<TransportCache>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Build a dispatcher over the two caches.
    pub fn new(
        fanouts: Arc<FanoutCache>,
        transports: Arc<TransportCache>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            fanouts,
            transports,
            config,
        }
    }

    /// Resolve the fanout after the name and cycle checks.
    ///
    /// Split from [`dispatch`] so the HTTP front can branch to the
    /// debug view with the resolved endpoint list.
    pub async fn resolve(&self, fanout: &str, inbound: &HeaderMap) -> Result<Vec<Endpoint>> {
        if fanout.is_empty() {
            return Err(DispatchError::MissingName);
        }
        // Fanouts may call other fanouts, but never themselves.
        if let Some(first) = inbound.get(FANOUT_HEADER) {
            if first.as_bytes() == fanout.as_bytes() {
                return Err(DispatchError::CircularCall);
            }
        }
        Ok(self.fanouts.get(fanout).await?)
    }

    /// Fan the request out and return the primary endpoint's response.
    pub async fn dispatch(
        &self,
        fanout: &str,
        endpoints: Vec<Endpoint>,
        inbound: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let mut tasks = JoinSet::new();
        for endpoint in endpoints {
            let transports = self.transports.clone();
            let fanout = fanout.to_string();
            let inbound = inbound.clone();
            let body = body.clone();
            let cap = self.config.max_endpoint_timeout;
            tasks.spawn(async move {
                call_endpoint(&transports, &fanout, &endpoint, &inbound, body, cap).await
            });
        }

        // Barrier over all units; dropping this future aborts them all,
        // which propagates inbound cancellation.
        let mut primary = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(response)) => primary = Some(response),
                Ok(None) => {}
                Err(err) => log::error!("Fanout task aborted: {}", err),
            }
        }

        primary.ok_or(DispatchError::NoPrimaryResponse)
    }
}

/// Execute one endpoint call. Returns the response only for a
/// successful primary; every failure is logged here and contributes
/// nothing.
async fn call_endpoint(
    transports: &TransportCache,
    fanout: &str,
    endpoint: &Endpoint,
    inbound: &HeaderMap,
    body: Bytes,
    cap: Duration,
) -> Option<reqwest::Response> {
    log::info!("Making a request to {:?}/{:?}", fanout, endpoint.name);
    let http = endpoint.http();

    let method = match Method::from_bytes(http.method.as_bytes()) {
        Ok(method) => method,
        Err(err) => {
            log::warn!(
                "Invalid method for {:?}/{:?}: {}",
                fanout,
                endpoint.name,
                err
            );
            return None;
        }
    };

    let transport = match transports.get(fanout, endpoint) {
        Ok(transport) => transport,
        Err(err) => {
            log::warn!(
                "Failed to create a client for {:?}/{:?}: {}",
                fanout,
                endpoint.name,
                err
            );
            return None;
        }
    };

    let headers = build_outbound_headers(inbound, &http.headers, fanout)?;

    let send = transport
        .client()
        .request(method, http.url.as_str())
        .headers(headers)
        .body(body)
        .send();

    let sent = match derive_deadline(http.timeout_ms, cap) {
        Some(deadline) => match tokio::time::timeout(deadline, send).await {
            Ok(sent) => sent,
            Err(_) => {
                log::warn!(
                    "Request to {:?}/{:?} exceeded {:?}",
                    fanout,
                    endpoint.name,
                    deadline
                );
                return None;
            }
        },
        None => send.await,
    };

    let response = match sent {
        Ok(response) => response,
        Err(err) => {
            log::warn!("Failed a request to {:?}/{:?}: {}", fanout, endpoint.name, err);
            return None;
        }
    };

    if let Err(err) = response.error_for_status_ref() {
        log::warn!("Failed a request to {:?}/{:?}: {}", fanout, endpoint.name, err);
        drain(response).await;
        return None;
    }

    if !endpoint.primary {
        drain(response).await;
        return None;
    }

    log::info!("Done with a request to {:?}/{:?}", fanout, endpoint.name);
    Some(response)
}

/// Per-call deadline: the endpoint's own timeout, else the dispatch
/// cap, else none.
fn derive_deadline(timeout_ms: u64, cap: Duration) -> Option<Duration> {
    if timeout_ms > 0 {
        Some(Duration::from_millis(timeout_ms))
    } else if !cap.is_zero() {
        Some(cap)
    } else {
        None
    }
}

/// Assemble outbound headers: inbound copy, endpoint headers appended,
/// breadcrumb set last (overriding any inbound value).
fn build_outbound_headers(
    inbound: &HeaderMap,
    endpoint_headers: &[HeaderPair],
    fanout: &str,
) -> Option<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound.iter() {
        if is_connection_header(name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    for pair in endpoint_headers {
        let name = match HeaderName::from_bytes(pair.key.as_bytes()) {
            Ok(name) => name,
            Err(err) => {
                log::warn!("Skipping invalid header key {:?}: {}", pair.key, err);
                continue;
            }
        };
        for value in &pair.values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(err) => {
                    log::warn!("Skipping invalid value for header {:?}: {}", pair.key, err)
                }
            }
        }
    }

    // The unit must not run without the breadcrumb.
    let breadcrumb = match HeaderValue::from_str(fanout) {
        Ok(value) => value,
        Err(err) => {
            log::warn!("Fanout name {:?} is not header-safe: {}", fanout, err);
            return None;
        }
    };
    headers.insert(HeaderName::from_static(FANOUT_HEADER), breadcrumb);
    Some(headers)
}

/// Headers scoped to the inbound connection; never forwarded.
fn is_connection_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

/// Read a discarded response to completion so its connection returns to
/// the pool.
async fn drain(response: reqwest::Response) {
    let _ = response.bytes().await;
}
