//! Time-slot load balancing across the 96 fifteen-minute slots of the day.
//!
//! Recurring jobs keep their assigned slot across intervals (rhythm
//! preservation); rebalancing may move jobs between slots but never inside
//! the anti-thrashing window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::job::JobId;
use crate::store::{JobStore, SlotJob, SLOT_COUNT};

/// Width of one slot.
pub const SLOT_MINUTES: i64 = 15;

/// Assignment considers slots within this distance of the candidate time.
pub const ASSIGN_TOLERANCE: Duration = Duration::minutes(7);

/// A job this close to its next run may not change slot.
pub const MIN_LEAD_FOR_MOVE: Duration = Duration::minutes(30);

/// A job moved this recently may not move again.
pub const MOVE_COOLDOWN: Duration = Duration::hours(1);

/// The 15-minute slot of the day containing `at`.
pub fn slot_of(at: DateTime<Utc>) -> i16 {
    ((at.hour() as i64 * 60 + at.minute() as i64) / SLOT_MINUTES) as i16
}

/// Slots whose window intersects `at` ± tolerance, in day order.
pub fn candidate_slots(at: DateTime<Utc>, tolerance: Duration) -> Vec<i16> {
    let lo = slot_of(at - tolerance);
    let hi = slot_of(at + tolerance);
    let mut slots = Vec::new();
    let mut s = lo;
    loop {
        slots.push(s);
        if s == hi {
            break;
        }
        s = (s + 1) % SLOT_COUNT as i16;
        // Guard against a tolerance wider than the day.
        if slots.len() >= SLOT_COUNT {
            break;
        }
    }
    slots
}

/// Pick the least-loaded slot among those within tolerance of `at`.
/// Ties go to the slot containing `at` itself, then to day order.
pub fn assign_slot(loads: &[i64; SLOT_COUNT], at: DateTime<Utc>, tolerance: Duration) -> i16 {
    let home = slot_of(at);
    let mut best = home;
    let mut best_load = loads[home as usize];
    for s in candidate_slots(at, tolerance) {
        let load = loads[s as usize];
        if load < best_load {
            best = s;
            best_load = load;
        }
    }
    best
}

/// Completion snapping applies only within this distance; beyond it the
/// naive time wins (a doubled adaptive interval must not be pulled back to
/// the old slot occurrence).
pub const SNAP_TOLERANCE: Duration = Duration::seconds(450);

/// Move `naive` inside the window of `slot`, choosing the day occurrence
/// nearest to `naive`. Times already inside the window are unchanged;
/// times outside are clamped to the nearest window edge. Idempotent.
pub fn align_into_slot(naive: DateTime<Utc>, slot: i16) -> DateTime<Utc> {
    let width = Duration::minutes(SLOT_MINUTES);
    let midnight = naive
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always representable")
        .and_utc();

    let mut best: Option<(DateTime<Utc>, Duration)> = None;
    for day in [-1i64, 0, 1] {
        let start =
            midnight + Duration::days(day) + Duration::minutes(slot as i64 * SLOT_MINUTES);
        let end = start + width;
        let clamped = if naive < start {
            start
        } else if naive >= end {
            end - Duration::minutes(1)
        } else {
            naive
        };
        let dist = (clamped - naive).abs();
        if best.map(|(_, d)| dist < d).unwrap_or(true) {
            best = Some((clamped, dist));
        }
    }
    best.expect("three candidates considered").0
}

/// Rhythm preservation for recurring completions: nudge into the job's slot
/// when the naive next run is close to it, otherwise leave the naive time
/// alone.
pub fn snap_into_slot(naive: DateTime<Utc>, slot: i16) -> DateTime<Utc> {
    let aligned = align_into_slot(naive, slot);
    if (aligned - naive).abs() <= SNAP_TOLERANCE {
        aligned
    } else {
        naive
    }
}

/// `1 - (max_slot_load - min_slot_load) / total`, in [0, 1]. 1.0 when empty.
pub fn distribution_score(loads: &[i64; SLOT_COUNT]) -> f64 {
    let total: i64 = loads.iter().sum();
    if total == 0 {
        return 1.0;
    }
    let max = *loads.iter().max().expect("non-empty");
    let min = *loads.iter().min().expect("non-empty");
    1.0 - (max - min) as f64 / total as f64
}

/// A proposed slot reassignment.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SlotMove {
    pub job_id: JobId,
    pub from_slot: i16,
    pub to_slot: i16,
}

/// Why `apply_rebalance` skipped a proposed move.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// `next_run_at - now < 30 minutes`.
    RunsTooSoon,
    /// `now - last_slot_moved_at < 1 hour`.
    MovedRecently,
    /// Lost the CAS: the job changed slot or state since the preview.
    Conflict,
}

/// Result of an `apply_rebalance` pass.
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceReport {
    pub moved: Vec<SlotMove>,
    pub skipped: Vec<(JobId, SkipReason)>,
    pub score: f64,
}

/// Per-slot load plus the distribution score, for the API.
#[derive(Debug, Clone, Serialize)]
pub struct SlotDistribution {
    pub loads: Vec<i64>,
    pub score: f64,
}

fn anti_thrash_violation(job: &SlotJob, now: DateTime<Utc>) -> Option<SkipReason> {
    if let Some(next) = job.next_run_at {
        if next - now < MIN_LEAD_FOR_MOVE {
            return Some(SkipReason::RunsTooSoon);
        }
    }
    if let Some(moved) = job.last_slot_moved_at {
        if now - moved < MOVE_COOLDOWN {
            return Some(SkipReason::MovedRecently);
        }
    }
    None
}

/// Pure rebalance planner: drain the most loaded slot into the least loaded
/// until the spread is within one job. Anti-thrashing is NOT applied here;
/// `apply_rebalance` re-checks each move and skips violations.
pub fn plan_rebalance(jobs: &[SlotJob]) -> Vec<SlotMove> {
    let mut loads = [0i64; SLOT_COUNT];
    let mut by_slot: Vec<Vec<&SlotJob>> = vec![Vec::new(); SLOT_COUNT];
    for job in jobs {
        let slot = job.time_slot.clamp(0, SLOT_COUNT as i16 - 1) as usize;
        loads[slot] += 1;
        by_slot[slot].push(job);
    }
    for slot in by_slot.iter_mut() {
        slot.sort_by_key(|j| j.id);
    }

    let mut moves = Vec::new();
    loop {
        let (max_slot, &max_load) = loads
            .iter()
            .enumerate()
            .max_by_key(|(_, l)| **l)
            .expect("non-empty");
        let (min_slot, &min_load) = loads
            .iter()
            .enumerate()
            .min_by_key(|(_, l)| **l)
            .expect("non-empty");
        if max_load - min_load <= 1 {
            break;
        }
        let Some(job) = by_slot[max_slot].pop() else {
            break;
        };
        moves.push(SlotMove {
            job_id: job.id,
            from_slot: max_slot as i16,
            to_slot: min_slot as i16,
        });
        loads[max_slot] -= 1;
        loads[min_slot] += 1;
    }
    moves
}

/// Slot distribution and rebalancing over the job store.
pub struct BucketMap<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> BucketMap<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn distribution(&self) -> Result<SlotDistribution> {
        let loads = self.store.slot_loads().await?;
        Ok(SlotDistribution {
            score: distribution_score(&loads),
            loads: loads.to_vec(),
        })
    }

    /// Pure computation, no writes.
    pub async fn preview_rebalance(&self) -> Result<Vec<SlotMove>> {
        let jobs = self.store.jobs_for_rebalance().await?;
        Ok(plan_rebalance(&jobs))
    }

    /// Apply the planned moves, skipping (and logging) jobs inside the
    /// anti-thrashing window. Each move is its own CAS.
    pub async fn apply_rebalance(&self) -> Result<RebalanceReport> {
        let now = self.clock.now();
        let jobs = self.store.jobs_for_rebalance().await?;
        let plan = plan_rebalance(&jobs);

        let mut moved = Vec::new();
        let mut skipped = Vec::new();
        for mv in plan {
            let Some(job) = jobs.iter().find(|j| j.id == mv.job_id) else {
                continue;
            };
            if let Some(reason) = anti_thrash_violation(job, now) {
                info!(
                    job_id = %mv.job_id,
                    from_slot = mv.from_slot,
                    to_slot = mv.to_slot,
                    reason = ?reason,
                    "rebalance skipping job inside anti-thrashing window"
                );
                skipped.push((mv.job_id, reason));
                continue;
            }
            let next_run = job
                .next_run_at
                .map(|t| align_into_slot(t, mv.to_slot))
                .unwrap_or_else(|| align_into_slot(now, mv.to_slot));
            if self
                .store
                .move_slot(mv.job_id, mv.from_slot, mv.to_slot, next_run, now)
                .await?
            {
                debug!(job_id = %mv.job_id, from_slot = mv.from_slot, to_slot = mv.to_slot, "moved job to new slot");
                moved.push(mv);
            } else {
                skipped.push((mv.job_id, SkipReason::Conflict));
            }
        }

        let loads = self.store.slot_loads().await?;
        Ok(RebalanceReport {
            moved,
            skipped,
            score: distribution_score(&loads),
        })
    }
}
