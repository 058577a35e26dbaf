//! Interval scheduler for the intake orchestration core.
//!
//! Drives jobs through their state machine with at-most-one concurrent
//! execution per job across a fleet of instances, adaptive interval growth
//! while source content is unchanged, exponential-backoff retry, and
//! 15-minute time-slot load spreading.

pub mod clock;
pub mod error;
pub mod events;
pub mod execution;
pub mod hash_store;
pub mod interval;
pub mod job;
pub mod lease;
pub mod scheduler;
pub mod slots;
pub mod store;
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use error::{Result, SchedulerError};
pub use events::{EventSubscriber, ExecutionEvent, SourceEvent};
pub use execution::{
    CrawlMetrics, ExecutionId, ExecutionMetadata, ExecutionStatus, ExtractionQuality, JobExecution,
};
pub use hash_store::{
    ContentHashStore, MemoryContentHashStore, ObservedChange, PostgresContentHashStore,
    SourceContentHash,
};
pub use job::{ControlAction, IntervalType, Job, JobId, JobStatus, SourceId};
pub use lease::LeaseManager;
pub use scheduler::{
    ExecutionHandler, ExecutionOutcome, ExecutionReport, NewJob, Scheduler, SchedulerConfig,
    SchedulerMetrics,
};
pub use slots::{BucketMap, RebalanceReport, SlotDistribution, SlotMove};
pub use store::{
    CompletionUpdate, ExecutionClose, JobFilter, JobStore, JobUpdate, MemoryJobStore, Page,
    PostgresJobStore, SchedulerTotals, SlotJob,
};
