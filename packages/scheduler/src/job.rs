//! Job model: the recurring or one-shot intake unit and its state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::SchedulerError;

/// Unique identifier for a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, PartialOrd, Ord,
)]
#[sqlx(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of an externally managed source configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct SourceId(pub Uuid);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are sinks until an operator resets them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit for `interval_minutes` (the magnitude field keeps its legacy name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "interval_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IntervalType {
    #[default]
    Minutes,
    Hours,
    Days,
}

impl IntervalType {
    pub fn to_duration(self, magnitude: i32) -> Duration {
        match self {
            IntervalType::Minutes => Duration::minutes(magnitude as i64),
            IntervalType::Hours => Duration::hours(magnitude as i64),
            IntervalType::Days => Duration::days(magnitude as i64),
        }
    }
}

/// Control actions an operator (or the event bus) can apply to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
    Retry,
    ForceRun,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Cancel => "cancel",
            ControlAction::Retry => "retry",
            ControlAction::ForceRun => "force-run",
        }
    }

    /// The set of statuses the action is valid from.
    pub fn valid_from(&self) -> &'static [JobStatus] {
        match self {
            ControlAction::Pause => &[JobStatus::Scheduled],
            ControlAction::Resume => &[JobStatus::Paused],
            ControlAction::Cancel => &[
                JobStatus::Pending,
                JobStatus::Scheduled,
                JobStatus::Running,
                JobStatus::Paused,
            ],
            ControlAction::Retry => &[JobStatus::Failed],
            ControlAction::ForceRun => &[JobStatus::Scheduled],
        }
    }

    pub fn allowed_from(&self, status: JobStatus) -> bool {
        self.valid_from().contains(&status)
    }
}

/// A recurring or one-shot intake unit.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = JobId::new())]
    pub id: JobId,
    pub source_id: SourceId,
    pub url: String,

    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = false)]
    pub is_paused: bool,

    // Scheduling
    #[builder(default, setter(strip_option))]
    pub interval_minutes: Option<i32>,
    #[builder(default)]
    pub interval_type: IntervalType,
    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_run_at: Option<DateTime<Utc>>,
    #[builder(default = true)]
    pub adaptive_scheduling: bool,

    // Retry policy
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default = 60)]
    pub retry_backoff_seconds: i32,
    #[builder(default = 0)]
    pub current_retry_count: i32,

    // Lease
    #[builder(default, setter(strip_option))]
    pub lease_token: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub lease_acquired_at: Option<DateTime<Utc>>,

    // Time-slot load balancing
    #[builder(default = 0)]
    pub time_slot: i16,
    #[builder(default, setter(strip_option))]
    pub last_slot_moved_at: Option<DateTime<Utc>>,

    #[builder(default = serde_json::Value::Null)]
    pub metadata: serde_json::Value,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The configured interval, if the job is recurring.
    pub fn interval(&self) -> Option<Duration> {
        self.interval_minutes
            .filter(|m| *m > 0)
            .map(|m| self.interval_type.to_duration(m))
    }

    pub fn is_recurring(&self) -> bool {
        self.interval().is_some()
    }

    /// The due-selection predicate (matched by `JobStore::due_jobs`).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Scheduled)
            && !self.is_paused
            && self.lease_token.is_none()
            && self.next_run_at.map(|t| t <= now).unwrap_or(false)
    }

    /// Validate a control action against the current status.
    pub fn check_transition(&self, action: ControlAction) -> Result<(), SchedulerError> {
        if action.allowed_from(self.status) {
            Ok(())
        } else {
            Err(SchedulerError::InvalidTransition {
                from: self.status,
                action: action.as_str(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus) -> Job {
        Job::builder()
            .source_id(SourceId(Uuid::now_v7()))
            .url("https://example.test/")
            .status(status)
            .build()
    }

    #[test]
    fn terminal_statuses_are_sinks() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn control_action_validity_follows_state_machine() {
        assert!(job(JobStatus::Scheduled)
            .check_transition(ControlAction::Pause)
            .is_ok());
        assert!(job(JobStatus::Paused)
            .check_transition(ControlAction::Resume)
            .is_ok());
        assert!(job(JobStatus::Failed)
            .check_transition(ControlAction::Retry)
            .is_ok());
        assert!(job(JobStatus::Running)
            .check_transition(ControlAction::Cancel)
            .is_ok());

        let err = job(JobStatus::Running)
            .check_transition(ControlAction::Pause)
            .unwrap_err();
        match err {
            SchedulerError::InvalidTransition { from, action } => {
                assert_eq!(from, JobStatus::Running);
                assert_eq!(action, "pause");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn due_predicate_requires_unleased_unpaused_past_due() {
        let now = Utc::now();
        let mut j = job(JobStatus::Scheduled);
        j.next_run_at = Some(now - Duration::seconds(1));
        assert!(j.is_due(now));

        j.is_paused = true;
        assert!(!j.is_due(now));
        j.is_paused = false;

        j.lease_token = Some(Uuid::new_v4());
        assert!(!j.is_due(now));
        j.lease_token = None;

        j.next_run_at = Some(now + Duration::minutes(5));
        assert!(!j.is_due(now));

        j.next_run_at = None;
        assert!(!j.is_due(now));
    }

    #[test]
    fn interval_accounts_for_unit() {
        let mut j = job(JobStatus::Scheduled);
        j.interval_minutes = Some(30);
        j.interval_type = IntervalType::Minutes;
        assert_eq!(j.interval(), Some(Duration::minutes(30)));

        j.interval_type = IntervalType::Hours;
        assert_eq!(j.interval(), Some(Duration::hours(30)));

        j.interval_minutes = None;
        assert_eq!(j.interval(), None);
        assert!(!j.is_recurring());
    }
}
