//! # HTTP Front
//!
//! Routes inbound traffic to the subsystems:
//! - `/fanout/:name`: dispatch, any method; `?debug` renders the debug view
//! - `/_groupcache/fanout/:name`: peer protocol of the definition cache
//! - `/admin/fanouts/:name`: CRUD over the definition store
//!
//! Request-level failures keep the reference behaviour: status 500 with
//! a literal plain-text body.

use crate::cache::FanoutCache;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::store::FanoutStore;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use bytes::Bytes;
use std::sync::Arc;

pub mod admin;
pub mod debug;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// Dispatch engine
    pub dispatcher: Arc<Dispatcher>,

    /// Definition cache (peer protocol endpoint)
    pub fanouts: Arc<FanoutCache>,

    /// Definition store (admin surface)
    pub store: Arc<dyn FanoutStore>,
}

/// Build the full router.
///
/// `max_body_bytes` caps the inbound body buffered for replay across
/// the fan-out.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/_groupcache/fanout/:name", get(peer_fanout))
        .route("/fanout/:name", any(serve_fanout))
        .nest("/admin", admin::router())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

async fn serve_fanout(
    State(state): State<AppState>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    log::info!("Serving fanout {:?}", name);

    let endpoints = match state.dispatcher.resolve(&name, &headers).await {
        Ok(endpoints) => endpoints,
        Err(err) => return failure(err),
    };

    if query_has_debug(query.as_deref()) {
        return debug::render(&name, &endpoints).into_response();
    }

    match state
        .dispatcher
        .dispatch(&name, endpoints, &headers, body)
        .await
    {
        Ok(response) => relay(response),
        Err(err) => failure(err),
    }
}

/// Serve a peer's fetch for a key this node owns. Always loads locally;
/// the requester already consulted its ring.
async fn peer_fanout(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.fanouts.get_local(&name).await {
        Ok(endpoints) => Json(endpoints).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Map a request-level dispatch failure to the reference wire shape.
fn failure(err: DispatchError) -> Response {
    let body = match &err {
        DispatchError::Resolve(_) => err.to_string(),
        other => format!("{}\n", other),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
}

/// Relay the primary endpoint's response: status and headers verbatim
/// (hop-by-hop excluded), body streamed through. Once streaming starts
/// the status is committed; a mid-stream copy failure can only abort
/// the connection.
fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if is_hop_response_header(name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
    }

    match builder.body(Body::from_stream(upstream.bytes_stream())) {
        Ok(response) => response,
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to serve body: {}", err),
        )
            .into_response(),
    }
}

/// Whether the query string carries a `debug` parameter.
fn query_has_debug(query: Option<&str>) -> bool {
    query
        .unwrap_or("")
        .split('&')
        .any(|pair| pair == "debug" || pair.starts_with("debug="))
}

/// Response headers scoped to the upstream connection; content-length
/// is recomputed because the body is re-framed while streaming.
fn is_hop_response_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}
