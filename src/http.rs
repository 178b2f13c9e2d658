//! Operational HTTP surface.
//!
//! Routes:
//! - `POST /rebuild/shard/{shard_id}` - enqueue one shard rebuild
//! - `POST /rebuild/index`            - enqueue a whole-index rebuild
//! - `GET  /healthz`                  - health check
//! - `GET  /metrics`                  - Prometheus metrics
//!
//! The registry's package CRUD API lives in a separate service; this binary
//! only exposes rebuild triggers and observability endpoints.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{error, info, instrument};

use crate::coordination::queue::{self, RebuildJob};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/rebuild/shard/{shard_id}", post(handle_rebuild_shard))
        .route("/rebuild/index", post(handle_rebuild_index))
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /rebuild/shard/{shard_id}`
///
/// Queues a rebuild of one shard. The request only validates the shard id
/// against the configured count; the worker loop does the rest.
#[instrument(skip(state))]
async fn handle_rebuild_shard(
    State(state): State<AppState>,
    Path(shard_id): Path<u32>,
) -> Result<Response, AppError> {
    if shard_id >= state.config.shards.count {
        return Ok((
            StatusCode::NOT_FOUND,
            format!(
                "shard {shard_id} does not exist (count is {})",
                state.config.shards.count
            ),
        )
            .into_response());
    }

    queue::enqueue(&state.keydb, RebuildJob::ShardRebuild { shard_id })
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
    info!(shard_id, "shard rebuild queued via HTTP");

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "queued": "shard_rebuild", "shard_id": shard_id })),
    )
        .into_response())
}

/// `POST /rebuild/index`
#[instrument(skip(state))]
async fn handle_rebuild_index(State(state): State<AppState>) -> Result<Response, AppError> {
    queue::enqueue(&state.keydb, RebuildJob::IndexRebuild)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
    info!("index rebuild queued via HTTP");

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "queued": "index_rebuild" })),
    )
        .into_response())
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the service.
async fn handle_metrics(State(state): State<AppState>) -> Result<Response, AppError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
