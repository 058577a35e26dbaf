//! Control API handlers.

pub mod admin;
pub mod health;
pub mod jobs;
pub mod scheduler_routes;

use serde::{Deserialize, Serialize};

/// Offset-paginated response envelope.
#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Common pagination query parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

impl PageQuery {
    pub fn clamped(self) -> scheduler::Page {
        scheduler::Page {
            limit: self.limit.clamp(1, 500),
            offset: self.offset.max(0),
        }
    }
}
