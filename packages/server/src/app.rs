//! Router assembly and shared handler state.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crawler::{Extractor, PageFetcher, SourceProvider};
use scheduler::slots::BucketMap;
use scheduler::{Clock, JobStore, Scheduler};

use crate::routes;

/// Everything the handlers need; generic over the store so tests run
/// against the in-memory implementation.
pub struct AppState<S: JobStore + 'static> {
    pub scheduler: Arc<Scheduler<S>>,
    pub bucket_map: Arc<BucketMap<S>>,
    pub store: Arc<S>,
    pub sources: Arc<dyn SourceProvider>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub extractor: Extractor,
    pub clock: Arc<dyn Clock>,
    /// Present in production; None when running against the memory store.
    pub db: Option<PgPool>,
}

impl<S: JobStore + 'static> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            bucket_map: self.bucket_map.clone(),
            store: self.store.clone(),
            sources: self.sources.clone(),
            fetcher: self.fetcher.clone(),
            extractor: self.extractor.clone(),
            clock: self.clock.clone(),
            db: self.db.clone(),
        }
    }
}

/// Build the control API router (§external interfaces).
pub fn build_app<S: JobStore + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health::<S>))
        .route(
            "/jobs",
            post(routes::jobs::create::<S>).get(routes::jobs::list::<S>),
        )
        .route("/jobs/bulk/pause", post(routes::jobs::bulk_pause::<S>))
        .route(
            "/jobs/:id",
            get(routes::jobs::get_one::<S>)
                .put(routes::jobs::update::<S>)
                .delete(routes::jobs::remove::<S>),
        )
        .route("/jobs/:id/pause", post(routes::jobs::pause::<S>))
        .route("/jobs/:id/resume", post(routes::jobs::resume::<S>))
        .route("/jobs/:id/cancel", post(routes::jobs::cancel::<S>))
        .route("/jobs/:id/retry", post(routes::jobs::retry::<S>))
        .route("/jobs/:id/force-run", post(routes::jobs::force_run::<S>))
        .route("/jobs/:id/executions", get(routes::jobs::executions::<S>))
        .route(
            "/scheduler/metrics",
            get(routes::scheduler_routes::metrics::<S>),
        )
        .route(
            "/scheduler/distribution",
            get(routes::scheduler_routes::distribution::<S>),
        )
        .route(
            "/scheduler/rebalance",
            post(routes::scheduler_routes::rebalance::<S>),
        )
        .route(
            "/scheduler/rebalance/preview",
            post(routes::scheduler_routes::rebalance_preview::<S>),
        )
        .route(
            "/admin/sync-enabled-sources",
            post(routes::admin::sync_enabled_sources::<S>),
        )
        .route("/admin/test-crawl", post(routes::admin::test_crawl::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crawler::testing::MockFetcher;
    use crawler::{SelectorSet, SourceConfig, StaticSourceProvider};
    use scheduler::testing::{ManualClock, StubHandler};
    use scheduler::{
        ContentHashStore, MemoryContentHashStore, MemoryJobStore, SchedulerConfig, SourceId,
    };

    fn test_app() -> (Router, SourceId) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryJobStore::new());
        let hash_store = Arc::new(MemoryContentHashStore::new());
        let handler = Arc::new(StubHandler::new(
            store.clone(),
            hash_store.clone() as Arc<dyn ContentHashStore>,
            clock.clone() as Arc<dyn Clock>,
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            hash_store,
            handler,
            clock.clone(),
            SchedulerConfig::default(),
        ));
        let bucket_map = Arc::new(BucketMap::new(store.clone(), clock.clone()));

        let source_id = SourceId(Uuid::now_v7());
        let sources = Arc::new(StaticSourceProvider::new().with_source(SourceConfig {
            id: source_id,
            name: "Example".into(),
            url: "https://x.test/".into(),
            rate_limit_ms: 0,
            max_depth: 3,
            enabled: true,
            refresh_interval_minutes: Some(30),
            selectors: SelectorSet {
                title: Some("h1".into()),
                body: Some("article".into()),
                ..Default::default()
            },
        }));
        let fetcher = Arc::new(MockFetcher::new().with_page(
            "https://x.test/",
            "<html><body><h1>Hi</h1><article><p>Body</p></article></body></html>",
        ));

        let state = AppState {
            scheduler,
            bucket_map,
            store,
            sources,
            fetcher,
            extractor: Extractor::default(),
            clock,
            db: None,
        };
        (build_app(state), source_id)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn job_lifecycle_over_http() {
        let (app, source_id) = test_app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/jobs",
                json!({
                    "source_id": source_id.0,
                    "url": "https://x.test/",
                    "interval_minutes": 30,
                    "schedule_enabled": true
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let job = body_json(response).await;
        assert_eq!(job["status"], "scheduled");
        let id = job["id"].as_str().unwrap().to_string();

        // Read it back.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Pause, then pause again: second one is an invalid transition.
        let response = app
            .clone()
            .oneshot(json_request("POST", &format!("/jobs/{id}/pause"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(json_request("POST", &format!("/jobs/{id}/pause"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let error = body_json(response).await;
        assert_eq!(error["kind"], "invalid_transition");
        assert_eq!(error["current_state"], "paused");

        // Paused jobs can be deleted.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/jobs/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_distribution_and_health_respond() {
        let (app, _) = test_app();

        for uri in ["/scheduler/metrics", "/scheduler/distribution", "/health"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "GET {uri}");
        }
    }

    #[tokio::test]
    async fn test_crawl_returns_preview_record() {
        let (app, source_id) = test_app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/admin/test-crawl",
                json!({ "source_id": source_id.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record = body_json(response).await;
        assert_eq!(record["title"], "Hi");
        assert_eq!(record["source_name"], "example");

        // Unknown source: 404.
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/admin/test-crawl",
                json!({ "source_id": Uuid::now_v7() }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bulk_pause_reports_per_job_results() {
        let (app, source_id) = test_app();

        let mut ids = Vec::new();
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(json_request(
                    "POST",
                    "/jobs",
                    json!({
                        "source_id": source_id.0,
                        "url": "https://x.test/",
                        "interval_minutes": 30,
                        "schedule_enabled": true
                    }),
                ))
                .await
                .unwrap();
            let job = body_json(response).await;
            ids.push(job["id"].as_str().unwrap().to_string());
        }
        let missing = Uuid::now_v7().to_string();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/jobs/bulk/pause",
                json!({ "job_ids": [ids[0], ids[1], missing] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let results = body_json(response).await;
        let results = results.as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["ok"], true);
        assert_eq!(results[1]["ok"], true);
        assert_eq!(results[2]["ok"], false);
    }
}
