//! Persistence boundary for the orchestration core.
//!
//! The store is the single source of truth shared by all workers; every
//! cross-worker coordination point (claiming, schedule advance, dead letter
//! creation) is a conditional write that either fully applies or reports
//! that the caller lost the race.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{CrawlJob, DeadLetterEntry, RetryHistory, RetryPolicy, ScheduledJob, Website};
use crate::types::{
    DeadLetterId, ErrorCategory, JobId, JobKind, JobStatus, ResolutionState, ScheduleId, WebsiteId,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Filter for job listings exposed to the administrative layer.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub website_id: Option<WebsiteId>,
    pub kind: Option<JobKind>,
    pub limit: Option<i64>,
}

/// Filter for dead letter listings.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub category: Option<ErrorCategory>,
    pub website_id: Option<WebsiteId>,
    pub resolution: Option<ResolutionState>,
    pub limit: Option<i64>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Websites (read-mostly; inserts exist for fixtures and the admin layer)
    async fn insert_website(&self, website: &Website) -> Result<()>;
    async fn get_website(&self, id: WebsiteId) -> Result<Option<Website>>;

    // Recurring schedules
    async fn insert_schedule(&self, schedule: &ScheduledJob) -> Result<()>;
    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduledJob>>;
    async fn set_schedule_active(&self, id: ScheduleId, active: bool) -> Result<()>;

    /// Active schedules with `next_run_at <= now`, ordered by `next_run_at`
    /// ascending, capped at `limit`.
    async fn due_schedules(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJob>>;

    /// Atomically create `job` and advance the schedule, guarded by the
    /// `next_run_at` value the caller read. Returns false (and writes
    /// nothing) when another scheduler instance already advanced it.
    async fn fire_schedule(
        &self,
        schedule_id: ScheduleId,
        seen_next_run: DateTime<Utc>,
        new_next_run: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        job: &CrawlJob,
    ) -> Result<bool>;

    // Jobs
    async fn insert_job(&self, job: &CrawlJob) -> Result<()>;
    async fn get_job(&self, id: JobId) -> Result<Option<CrawlJob>>;
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<CrawlJob>>;

    /// Atomically claim up to `limit` due pending jobs for `worker_id`.
    /// Selection orders by priority descending then creation time ascending;
    /// at most one worker ever observes a given job transition out of
    /// pending.
    async fn claim_jobs(
        &self,
        worker_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<CrawlJob>>;

    /// Monotonic progress update; never touches status.
    async fn update_progress(&self, id: JobId, progress: i64) -> Result<()>;

    /// Running → Completed. Returns false when the job was not running.
    async fn complete_job(&self, id: JobId, at: DateTime<Utc>) -> Result<bool>;

    /// Running → Pending with the new retry count and a future
    /// `scheduled_at`. Returns false when the job was not running.
    async fn requeue_for_retry(
        &self,
        id: JobId,
        retry_count: i32,
        scheduled_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool>;

    /// Running → Failed, terminally. Returns false when the job was not
    /// running.
    async fn fail_job_terminally(&self, id: JobId, error_message: &str) -> Result<bool>;

    /// Pending|Running → Cancelled with actor and reason. Returns false
    /// when the job was already terminal.
    async fn cancel_job(&self, id: JobId, actor: &str, reason: &str) -> Result<bool>;

    /// Jobs stuck in `running` since before `cutoff`.
    async fn stale_running_jobs(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CrawlJob>>;

    /// Remove terminal jobs whose last update predates `older_than`.
    async fn purge_terminal_jobs(&self, older_than: DateTime<Utc>) -> Result<u64>;

    // Retry history (append-only)
    async fn append_retry_history(&self, entry: &RetryHistory) -> Result<()>;
    async fn list_retry_history(&self, job_id: JobId) -> Result<Vec<RetryHistory>>;

    // Retry policies
    async fn upsert_policy(&self, policy: &RetryPolicy) -> Result<()>;
    async fn get_policy(&self, category: ErrorCategory) -> Result<Option<RetryPolicy>>;
    async fn list_policies(&self) -> Result<Vec<RetryPolicy>>;

    // Dead letters
    /// Idempotent per job id: returns false when an entry for the job
    /// already exists, and writes nothing in that case.
    async fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> Result<bool>;
    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>>;
    async fn get_dead_letter_for_job(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>>;
    async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>>;

    /// Record a manual retry attempt and its outcome. Does not re-run the
    /// job. Returns false for already-resolved entries.
    async fn mark_manual_retry(&self, id: DeadLetterId, outcome: &str) -> Result<bool>;

    /// Resolve an entry with optional notes. Resolving an already-resolved
    /// entry is a no-op (returns false) and keeps prior notes unless
    /// `overwrite_notes` is set.
    async fn resolve_dead_letter(
        &self,
        id: DeadLetterId,
        notes: Option<&str>,
        overwrite_notes: bool,
    ) -> Result<bool>;

    /// Resolve many entries at once; returns how many actually changed.
    async fn bulk_resolve(&self, ids: &[DeadLetterId], notes: Option<&str>) -> Result<u64>;

    /// Oldest unresolved entry, for operator backlog alerting.
    async fn oldest_unresolved(&self) -> Result<Option<DeadLetterEntry>>;
}
