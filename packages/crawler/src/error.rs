//! Typed errors for the crawl side of the core.
//!
//! `FetchError` is the closed taxonomy of per-request failures; retryability
//! and the failure bucket recorded on executions both derive from the
//! variant, never from message text.

use thiserror::Error;

use scheduler::SourceId;

/// Per-request fetch failures.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("dns resolution failed for {host}")]
    Dns { host: String },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("timed out fetching {url}")]
    Timeout { url: String },

    #[error("http {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("robots.txt disallows {url}")]
    RobotsDisallowed { url: String },

    #[error("redirect chain exceeded {max} hops")]
    TooManyRedirects { max: usize },

    #[error("body larger than {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("parse failure: {0}")]
    Parse(String),
}

/// Failure bucket recorded on frontier entries and execution metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureBucket {
    RobotsDisallow,
    TooManyRedirects,
    Timeout,
    Http4xx,
    Http5xx,
    ParseError,
    BodyTooLarge,
}

impl FailureBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureBucket::RobotsDisallow => "robots_disallow",
            FailureBucket::TooManyRedirects => "too_many_redirects",
            FailureBucket::Timeout => "timeout",
            FailureBucket::Http4xx => "http_4xx",
            FailureBucket::Http5xx => "http_5xx",
            FailureBucket::ParseError => "parse_error",
            FailureBucket::BodyTooLarge => "body_too_large",
        }
    }
}

impl FetchError {
    /// DNS, connect, timeout, 5xx and 429 are worth retrying; everything
    /// else is a property of the URL or the site and will not improve.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Dns { .. } | FetchError::Connect(_) | FetchError::Timeout { .. } => true,
            FetchError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn bucket(&self) -> FailureBucket {
        match self {
            // Transport-level failures share the timeout bucket.
            FetchError::Dns { .. } | FetchError::Connect(_) | FetchError::Timeout { .. } => {
                FailureBucket::Timeout
            }
            FetchError::HttpStatus { status, .. } if *status >= 500 => FailureBucket::Http5xx,
            FetchError::HttpStatus { .. } => FailureBucket::Http4xx,
            FetchError::RobotsDisallowed { .. } => FailureBucket::RobotsDisallow,
            FetchError::TooManyRedirects { .. } => FailureBucket::TooManyRedirects,
            FetchError::BodyTooLarge { .. } => FailureBucket::BodyTooLarge,
            FetchError::InvalidUrl { .. } | FetchError::Parse(_) => FailureBucket::ParseError,
        }
    }
}

/// Errors from the crawl runtime and its stores.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("store unavailable: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("source config {0} not found")]
    SourceNotFound(SourceId),

    #[error("source manager unreachable: {0}")]
    SourceManager(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<sqlx::Error> for CrawlError {
    fn from(e: sqlx::Error) -> Self {
        CrawlError::Store(Box::new(e))
    }
}

impl From<scheduler::SchedulerError> for CrawlError {
    fn from(e: scheduler::SchedulerError) -> Self {
        CrawlError::Store(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_subset_matches_taxonomy() {
        assert!(FetchError::Dns {
            host: "x.test".into()
        }
        .is_retryable());
        assert!(FetchError::Connect("reset".into()).is_retryable());
        assert!(FetchError::Timeout {
            url: "https://x.test/".into()
        }
        .is_retryable());
        assert!(FetchError::HttpStatus {
            status: 503,
            url: "https://x.test/".into()
        }
        .is_retryable());
        assert!(FetchError::HttpStatus {
            status: 429,
            url: "https://x.test/".into()
        }
        .is_retryable());

        assert!(!FetchError::HttpStatus {
            status: 404,
            url: "https://x.test/".into()
        }
        .is_retryable());
        assert!(!FetchError::BodyTooLarge { limit: 10 }.is_retryable());
        assert!(!FetchError::RobotsDisallowed {
            url: "https://x.test/".into()
        }
        .is_retryable());
        assert!(!FetchError::TooManyRedirects { max: 5 }.is_retryable());
    }

    #[test]
    fn buckets_are_distinguishable() {
        assert_eq!(
            FetchError::TooManyRedirects { max: 5 }.bucket().as_str(),
            "too_many_redirects"
        );
        assert_eq!(
            FetchError::HttpStatus {
                status: 404,
                url: String::new()
            }
            .bucket(),
            FailureBucket::Http4xx
        );
        assert_eq!(
            FetchError::HttpStatus {
                status: 500,
                url: String::new()
            }
            .bucket(),
            FailureBucket::Http5xx
        );
    }
}
