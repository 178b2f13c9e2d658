use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub keydb: CheckResult,
    pub database: CheckResult,
    pub storage: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_keydb(pool: &fred::clients::Pool) -> CheckResult {
    match fred::interfaces::ClientLike::ping::<String>(pool, None).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e}")),
    }
}

async fn check_database(pool: &sqlx::PgPool) -> CheckResult {
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("SELECT 1 failed: {e}")),
    }
}

async fn check_storage(storage: &crate::storage::s3::SnapshotStorage) -> CheckResult {
    match storage.bucket_reachable().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("HeadBucket failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // KeyDB and Postgres are required for every operation; the bucket is
    // only needed once a rebuild reaches its upload step.
    let any_critical = !checks.keydb.ok || !checks.database.ok;

    if any_critical {
        HealthStatus::Unhealthy
    } else if !checks.storage.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (keydb, database, storage) = tokio::join!(
        check_keydb(&state.keydb),
        check_database(&state.db),
        check_storage(&state.storage),
    );

    let checks = HealthChecks {
        keydb,
        database,
        storage,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_requires_keydb_and_database() {
        let checks = HealthChecks {
            keydb: CheckResult::unhealthy("down"),
            database: CheckResult::healthy(),
            storage: CheckResult::healthy(),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Unhealthy);

        let checks = HealthChecks {
            keydb: CheckResult::healthy(),
            database: CheckResult::unhealthy("down"),
            storage: CheckResult::healthy(),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_storage_outage_is_degraded() {
        let checks = HealthChecks {
            keydb: CheckResult::healthy(),
            database: CheckResult::healthy(),
            storage: CheckResult::unhealthy("403"),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Degraded);
    }

    #[test]
    fn test_all_healthy() {
        let checks = HealthChecks {
            keydb: CheckResult::healthy(),
            database: CheckResult::healthy(),
            storage: CheckResult::healthy(),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Ok);
    }
}
