//! Error-to-HTTP mapping for the control API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crawler::CrawlError;
use scheduler::SchedulerError;

/// API-facing error wrapper; the variant decides the status code.
#[derive(Debug)]
pub enum ApiError {
    Scheduler(SchedulerError),
    Crawl(CrawlError),
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_state: Option<String>,
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        ApiError::Scheduler(e)
    }
}

impl From<CrawlError> for ApiError {
    fn from(e: CrawlError) -> Self {
        ApiError::Crawl(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, current_state, message) = match &self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "invalid_input", None, message.clone())
            }
            ApiError::Scheduler(e) => match e {
                SchedulerError::InvalidInput(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_input", None, e.to_string())
                }
                SchedulerError::InvalidTransition { from, .. } => (
                    StatusCode::CONFLICT,
                    "invalid_transition",
                    Some(from.to_string()),
                    e.to_string(),
                ),
                SchedulerError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found", None, e.to_string())
                }
                SchedulerError::Conflict(_) => {
                    (StatusCode::CONFLICT, "conflict", None, e.to_string())
                }
                SchedulerError::TransientDependency(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "transient_dependency",
                    None,
                    e.to_string(),
                ),
                SchedulerError::Fatal(_) => {
                    error!(error = %e, "invariant violation surfaced to API");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "fatal",
                        None,
                        e.to_string(),
                    )
                }
            },
            ApiError::Crawl(e) => match e {
                CrawlError::SourceNotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found", None, e.to_string())
                }
                CrawlError::Fetch(_) => {
                    (StatusCode::BAD_GATEWAY, "crawl_failure", None, e.to_string())
                }
                CrawlError::SourceManager(_) | CrawlError::Sink(_) => {
                    (StatusCode::BAD_GATEWAY, "upstream", None, e.to_string())
                }
                CrawlError::Store(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "transient_dependency",
                    None,
                    e.to_string(),
                ),
                CrawlError::Cancelled => {
                    (StatusCode::CONFLICT, "cancelled", None, e.to_string())
                }
            },
        };

        (
            status,
            Json(ErrorBody {
                error: message,
                kind,
                current_state,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler::JobStatus;

    #[test]
    fn invalid_transition_maps_to_409_with_state() {
        let response = ApiError::from(SchedulerError::InvalidTransition {
            from: JobStatus::Running,
            action: "pause",
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn transient_maps_to_503() {
        let response = ApiError::from(SchedulerError::TransientDependency(
            "db down".to_string().into(),
        ))
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
