//! HTTP front end for a store node.
//!
//! - `POST /store` sets every pair of a JSON object
//! - `GET /store/:key` returns the local value as text
//! - `DELETE /store/:key` deletes a key
//! - `POST /join` adds a voter, `{"id": .., "addr": ..}`
//! - `GET /status` reports `{me, leader, followers}`
//!
//! The store blocks while waiting for commit, so every call into it runs on
//! tokio's blocking pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::consensus::Consensus;
use crate::error::StoreError;
use crate::kv::Store;
use crate::topology::ClusterStatus;

/// Request body for `POST /join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("request task failed: {0}")]
    Task(#[from] JoinError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(StoreError::NotLeader) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(StoreError::CommitTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}

/// Builds the router over `store`.
pub fn router<C: Consensus + 'static>(store: Arc<Store<C>>) -> Router {
    Router::new()
        .route("/store", post(set_keys::<C>))
        .route("/store/:key", get(get_key::<C>).delete(delete_key::<C>))
        .route("/join", post(join::<C>))
        .route("/status", get(status::<C>))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

/// Runs `f` against the store on the blocking pool.
async fn blocking<C, T, F>(store: Arc<Store<C>>, f: F) -> Result<T, ApiError>
where
    C: Consensus + 'static,
    T: Send + 'static,
    F: FnOnce(&Store<C>) -> Result<T, StoreError> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
}

/// Sets pairs in key order. The first failure stops the rest; pairs
/// before it stay set.
async fn set_keys<C: Consensus + 'static>(
    State(store): State<Arc<Store<C>>>,
    Json(pairs): Json<BTreeMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    blocking(store, move |store| {
        for (key, value) in &pairs {
            store.set(key, value)?;
        }
        Ok(())
    })
    .await?;
    Ok(StatusCode::OK)
}

async fn get_key<C: Consensus + 'static>(
    State(store): State<Arc<Store<C>>>,
    Path(key): Path<String>,
) -> String {
    store.get(&key)
}

async fn delete_key<C: Consensus + 'static>(
    State(store): State<Arc<Store<C>>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    blocking(store, move |store| store.delete(&key)).await?;
    Ok(StatusCode::OK)
}

async fn join<C: Consensus + 'static>(
    State(store): State<Arc<Store<C>>>,
    Json(request): Json<JoinRequest>,
) -> Result<StatusCode, ApiError> {
    blocking(store, move |store| store.join(&request.id, &request.addr)).await?;
    Ok(StatusCode::OK)
}

async fn status<C: Consensus + 'static>(
    State(store): State<Arc<Store<C>>>,
) -> Result<Json<ClusterStatus>, ApiError> {
    let status = blocking(store, |store| store.status()).await?;
    Ok(Json(status))
}
