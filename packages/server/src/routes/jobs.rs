//! Job CRUD, control actions, and execution history.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scheduler::{
    Job, JobExecution, JobFilter, JobId, JobStatus, JobStore, JobUpdate, NewJob, SchedulerError,
    SourceId,
};

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};
use crate::routes::{PageQuery, Paginated};

pub async fn create<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Json(new): Json<NewJob>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let job = state.scheduler.create_job(new).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<JobStatus>,
    pub source_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Paginated<Job>>> {
    let page = PageQuery {
        limit: query.limit,
        offset: query.offset,
    }
    .clamped();
    let filter = JobFilter {
        status: query.status,
        source_id: query.source_id.map(SourceId),
    };
    let (items, total) = state.store.list_jobs(&filter, page).await?;
    Ok(Json(Paginated {
        items,
        total,
        limit: page.limit,
        offset: page.offset,
    }))
}

pub async fn get_one<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    let id = JobId(id);
    let job = state
        .store
        .get_job(id)
        .await?
        .ok_or(SchedulerError::NotFound(id))?;
    Ok(Json(job))
}

pub async fn update<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
    Json(update): Json<JobUpdate>,
) -> ApiResult<Json<Job>> {
    if let Some(Some(interval)) = update.interval_minutes {
        if interval <= 0 {
            return Err(ApiError::BadRequest(
                "interval_minutes must be positive when present".into(),
            ));
        }
    }
    let job = state.store.update_job(JobId(id), update).await?;
    Ok(Json(job))
}

pub async fn remove<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.store.delete_job(JobId(id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(SchedulerError::Conflict(
            "job must be paused or terminal before deletion".into(),
        )
        .into())
    }
}

pub async fn pause<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.scheduler.pause(JobId(id)).await?))
}

pub async fn resume<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.scheduler.resume(JobId(id)).await?))
}

pub async fn cancel<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.scheduler.cancel(JobId(id)).await?))
}

pub async fn retry<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.scheduler.retry(JobId(id)).await?))
}

pub async fn force_run<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.scheduler.force_run(JobId(id)).await?))
}

pub async fn executions<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Paginated<JobExecution>>> {
    let id = JobId(id);
    state
        .store
        .get_job(id)
        .await?
        .ok_or(SchedulerError::NotFound(id))?;
    let page = page.clamped();
    let (items, total) = state.store.list_executions(id, page).await?;
    Ok(Json(Paginated {
        items,
        total,
        limit: page.limit,
        offset: page.offset,
    }))
}

#[derive(Debug, Deserialize)]
pub struct BulkPauseRequest {
    pub job_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct BulkPauseResult {
    pub job_id: Uuid,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Best-effort parallel pause with per-job result reporting; already-paused
/// jobs are left as they are, not rolled back.
pub async fn bulk_pause<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Json(request): Json<BulkPauseRequest>,
) -> ApiResult<Json<Vec<BulkPauseResult>>> {
    let results = join_all(request.job_ids.iter().map(|&id| {
        let scheduler = state.scheduler.clone();
        async move {
            match scheduler.pause(JobId(id)).await {
                Ok(_) => BulkPauseResult {
                    job_id: id,
                    ok: true,
                    error: None,
                },
                Err(e) => BulkPauseResult {
                    job_id: id,
                    ok: false,
                    error: Some(e.to_string()),
                },
            }
        }
    }))
    .await;
    Ok(Json(results))
}
