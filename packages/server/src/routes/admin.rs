//! Admin operations: source reconciliation and crawl previews.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crawler::{preview_crawl, CanonicalRecord, CrawlError};
use scheduler::{JobStore, SourceId};

use crate::app::AppState;
use crate::error::ApiResult;
use crate::events::{reconcile_sources, ReconcileReport};

/// Full reconciliation against the Source Manager, for recovery after
/// missed events.
pub async fn sync_enabled_sources<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
) -> ApiResult<Json<ReconcileReport>> {
    let report = reconcile_sources(
        state.scheduler.as_ref(),
        state.store.as_ref(),
        state.sources.as_ref(),
    )
    .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct TestCrawlRequest {
    pub source_id: Uuid,
}

/// A real preview: fetch and extract the source's seed URL, returning the
/// would-be canonical record. Nothing is written and nothing is emitted.
pub async fn test_crawl<S: JobStore + 'static>(
    State(state): State<AppState<S>>,
    Json(request): Json<TestCrawlRequest>,
) -> ApiResult<Json<CanonicalRecord>> {
    let source_id = SourceId(request.source_id);
    let source = state
        .sources
        .get_source(source_id)
        .await?
        .ok_or(CrawlError::SourceNotFound(source_id))?;
    let record = preview_crawl(
        state.fetcher.as_ref(),
        &state.extractor,
        &source,
        state.clock.as_ref(),
    )
    .await?;
    Ok(Json(record))
}
