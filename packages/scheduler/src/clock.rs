//! Injectable time source.
//!
//! Every component that needs the current time takes a `Clock` so tests can
//! drive the scheduler deterministically (see `testing::ManualClock`).

use chrono::{DateTime, Utc};

/// Trait for the current-time source (to allow test clocks).
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
