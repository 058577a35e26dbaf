//! Health endpoint: database connectivity and pool stats.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use scheduler::JobStore;

use crate::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    database: DatabaseHealth,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pool_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    idle_connections: Option<usize>,
}

pub async fn health<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
) -> (StatusCode, Json<HealthResponse>) {
    let database = match &state.db {
        Some(pool) => {
            let ping = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                sqlx::query("SELECT 1").execute(pool),
            )
            .await;
            match ping {
                Ok(Ok(_)) => DatabaseHealth {
                    status: "ok",
                    error: None,
                    pool_size: Some(pool.size()),
                    idle_connections: Some(pool.num_idle()),
                },
                Ok(Err(e)) => DatabaseHealth {
                    status: "error",
                    error: Some(e.to_string()),
                    pool_size: Some(pool.size()),
                    idle_connections: Some(pool.num_idle()),
                },
                Err(_) => DatabaseHealth {
                    status: "error",
                    error: Some("query timeout (>5s)".to_string()),
                    pool_size: Some(pool.size()),
                    idle_connections: Some(pool.num_idle()),
                },
            }
        }
        // Memory-backed instance (tests, local development).
        None => DatabaseHealth {
            status: "ok",
            error: None,
            pool_size: None,
            idle_connections: None,
        },
    };

    let healthy = database.status == "ok";
    (
        if healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        },
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" },
            database,
        }),
    )
}
