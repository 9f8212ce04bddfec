//! Orchestration core for the crawling platform.
//!
//! Owns the full lifecycle of crawl jobs: recurring schedules fire into the
//! queue, workers claim atomically, failures are classified and retried with
//! backoff, and abandoned jobs land in the dead letter pipeline.

pub mod backoff;
pub mod dead_letter;
pub mod engine;
pub mod models;
pub mod schedule_expr;
pub mod scheduler;
pub mod store;
pub mod types;

pub use dead_letter::DeadLetterPipeline;
pub use engine::{FailureDisposition, JobEngine, SubmitRequest};
pub use models::{CrawlJob, DeadLetterEntry, RetryHistory, RetryPolicy, ScheduledJob, Website};
pub use scheduler::{RecurringScheduler, SchedulerConfig};
pub use store::{DeadLetterFilter, JobFilter, MemoryStore, PostgresStore, Store};
pub use types::{
    BackoffStrategy, ErrorCategory, FetchFailure, JobId, JobKind, JobSpec, JobStatus,
    ResolutionState, ScheduleId, WebsiteId,
};
