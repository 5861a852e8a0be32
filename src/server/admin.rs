//! Admin surface: thin JSON CRUD over the definition store.
//!
//! Write-time invariant violations (primary count, endpoint cap,
//! invalid names) map to 400; store failures to 500. There is no
//! push-based cache invalidation on writes; readers converge within
//! the cache TTL.

use super::AppState;
use crate::model::Endpoint;
use crate::store::{FanoutUpdate, StoreError};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

/// Routes nested under `/admin`.
pub fn router() -> Router<AppState> {
    Router::new().route(
        "/fanouts/:name",
        post(create_fanout)
            .get(get_fanout)
            .put(update_fanout)
            .delete(delete_fanout),
    )
}

async fn create_fanout(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(endpoints): Json<Vec<Endpoint>>,
) -> Response {
    match state.store.create_fanout(&name, &endpoints).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => store_failure(err),
    }
}

async fn get_fanout(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.store.get_fanout(&name).await {
        Ok(endpoints) => Json(endpoints).into_response(),
        Err(err) => store_failure(err),
    }
}

async fn update_fanout(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<FanoutUpdate>,
) -> Response {
    match state.store.update_fanout(&name, update).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_failure(err),
    }
}

async fn delete_fanout(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.store.delete_fanout(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_failure(err),
    }
}

fn store_failure(err: StoreError) -> Response {
    let status = match err {
        StoreError::InvalidName(_)
        | StoreError::TooManyEndpoints(_)
        | StoreError::PrimaryCount(_)
        | StoreError::DuplicateEndpoint(_) => StatusCode::BAD_REQUEST,
        StoreError::MalformedRecord(..) | StoreError::Database(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string()).into_response()
}
