//! Typed errors for the scheduler.
//!
//! Uses `thiserror` with a small closed set of kinds; call sites switch on
//! the variant, never on message text.

use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Errors surfaced by the scheduler core.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Bad input from a caller (surfaced as 4xx).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A control action was applied in a state that does not permit it.
    #[error("cannot {action} a job in state {from}")]
    InvalidTransition {
        from: JobStatus,
        action: &'static str,
    },

    /// Job or execution does not exist.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Lost an optimistic-concurrency race. The scheduler loop swallows
    /// this; user-initiated operations surface it as 409.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The relational store or another dependency is unreachable. The loop
    /// backs off and retries; API callers get 503.
    #[error("dependency unavailable: {0}")]
    TransientDependency(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Programmer invariant violation. Callers crash the instance; the
    /// lease reaper recovers any held jobs.
    #[error("invariant violated: {0}")]
    Fatal(String),
}

impl SchedulerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SchedulerError::Conflict(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::TransientDependency(_))
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                SchedulerError::Conflict(db.to_string())
            }
            _ => SchedulerError::TransientDependency(Box::new(e)),
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::InvalidInput(format!("invalid metadata payload: {e}"))
    }
}

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
