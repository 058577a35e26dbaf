//! Next-run and retry-backoff computation.
//!
//! Pure functions; the scheduler loop and the control API both go through
//! these so the caps apply everywhere.

use chrono::{DateTime, Duration, Utc};

/// Adaptive doubling never pushes the effective interval past this.
pub const MAX_ADAPTIVE_INTERVAL: Duration = Duration::hours(24);

/// Retry backoff cap in seconds.
pub const MAX_RETRY_BACKOFF_SECS: i64 = 3600;

/// Effective interval for a recurring job.
///
/// With adaptive scheduling the interval is `base * 2^unchanged_count`,
/// capped at 24 hours. Without it the base interval is used as-is.
pub fn effective_interval(base: Duration, adaptive: bool, unchanged_count: u32) -> Duration {
    if !adaptive || unchanged_count == 0 {
        return base.min(MAX_ADAPTIVE_INTERVAL).max(Duration::zero());
    }
    // 2^31 minutes already exceeds the cap; clamp the exponent before shifting.
    let exp = unchanged_count.min(31);
    let scaled = base
        .num_seconds()
        .checked_shl(exp)
        .unwrap_or(i64::MAX)
        .min(MAX_ADAPTIVE_INTERVAL.num_seconds());
    Duration::seconds(scaled)
}

/// Next run time from now, given the effective interval.
pub fn next_run_at(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    now + interval
}

/// Exponential retry backoff: `base * 2^(attempt - 1)`, capped at one hour.
///
/// `attempt` is 1-based (the delay before the Nth retry attempt).
pub fn retry_backoff(base_seconds: i32, attempt: i32) -> Duration {
    let base = base_seconds.max(1) as i64;
    let exp = (attempt.max(1) - 1).min(31) as u32;
    let secs = base
        .checked_shl(exp)
        .unwrap_or(i64::MAX)
        .min(MAX_RETRY_BACKOFF_SECS);
    Duration::seconds(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_interval_when_not_adaptive() {
        let base = Duration::minutes(30);
        assert_eq!(effective_interval(base, false, 7), base);
    }

    #[test]
    fn adaptive_interval_doubles_per_unchanged_observation() {
        let base = Duration::minutes(30);
        assert_eq!(effective_interval(base, true, 0), Duration::minutes(30));
        assert_eq!(effective_interval(base, true, 1), Duration::minutes(60));
        assert_eq!(effective_interval(base, true, 3), Duration::minutes(240));
    }

    #[test]
    fn adaptive_interval_caps_at_24_hours() {
        let base = Duration::minutes(30);
        // unchanged_count = 12 would be baseline * 4096 uncapped.
        assert_eq!(effective_interval(base, true, 12), MAX_ADAPTIVE_INTERVAL);
        // Absurd counts must not overflow.
        assert_eq!(effective_interval(base, true, 200), MAX_ADAPTIVE_INTERVAL);
    }

    #[test]
    fn backoff_sequence_doubles_from_base() {
        // Delays before attempts 2..5 with base 60: 60, 120, 240, 480.
        let delays: Vec<i64> = (1..=4)
            .map(|attempt| retry_backoff(60, attempt).num_seconds())
            .collect();
        assert_eq!(delays, vec![60, 120, 240, 480]);
    }

    #[test]
    fn backoff_caps_at_one_hour() {
        // The 20th retry waits 3600s, not 60 * 2^19.
        assert_eq!(retry_backoff(60, 20).num_seconds(), 3600);
        assert_eq!(retry_backoff(60, 64).num_seconds(), 3600);
    }

    #[test]
    fn backoff_tolerates_degenerate_config() {
        assert_eq!(retry_backoff(0, 1).num_seconds(), 1);
        assert_eq!(retry_backoff(60, 0).num_seconds(), 60);
    }
}
