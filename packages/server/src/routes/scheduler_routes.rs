//! Scheduler observability and slot rebalancing.

use axum::extract::State;
use axum::Json;

use scheduler::slots::{RebalanceReport, SlotDistribution, SlotMove};
use scheduler::{JobStore, SchedulerMetrics};

use crate::app::AppState;
use crate::error::ApiResult;

pub async fn metrics<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
) -> ApiResult<Json<SchedulerMetrics>> {
    Ok(Json(state.scheduler.metrics().await?))
}

pub async fn distribution<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
) -> ApiResult<Json<SlotDistribution>> {
    Ok(Json(state.bucket_map.distribution().await?))
}

pub async fn rebalance_preview<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
) -> ApiResult<Json<Vec<SlotMove>>> {
    Ok(Json(state.bucket_map.preview_rebalance().await?))
}

pub async fn rebalance<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
) -> ApiResult<Json<RebalanceReport>> {
    Ok(Json(state.bucket_map.apply_rebalance().await?))
}
