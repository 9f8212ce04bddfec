//! The crawl job: the unit of work flowing through the lifecycle engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{JobId, JobKind, JobSpec, JobStatus, Priority, ScheduleId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: JobId,
    /// Configuration source: website template or inline document.
    pub spec: JobSpec,
    pub kind: JobKind,
    pub seed_url: String,
    /// Higher runs first; ties break on creation time ascending.
    pub priority: Priority,
    pub status: JobStatus,
    /// Monotonic progress counter; never affects status.
    pub progress: i64,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Schedule that produced this job, when kind is `Scheduled`.
    pub schedule_id: Option<ScheduleId>,
    /// Schedule's config override, snapshotted at fire time. Merged over
    /// the website's config document by the fetcher; later edits to the
    /// schedule do not reach jobs already fired.
    pub config_override: Option<serde_json::Value>,
    /// Jobs with a future `scheduled_at` are excluded from claiming until due.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrawlJob {
    fn base(spec: JobSpec, kind: JobKind, seed_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            spec,
            kind,
            seed_url: seed_url.into(),
            priority: 0,
            status: JobStatus::Pending,
            progress: 0,
            retry_count: 0,
            max_retries: 3,
            schedule_id: None,
            config_override: None,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            error_message: None,
            cancellation_reason: None,
            cancelled_by: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// One-time job against a website template.
    pub fn one_time(website_id: crate::types::WebsiteId, seed_url: impl Into<String>) -> Self {
        Self::base(JobSpec::Templated { website_id }, JobKind::OneTime, seed_url)
    }

    /// One-time job carrying its own configuration document.
    pub fn inline(config: serde_json::Value, seed_url: impl Into<String>) -> Self {
        Self::base(JobSpec::Inline { config }, JobKind::OneTime, seed_url)
    }

    /// Seed-submission job (ad hoc URL pushed through the admin surface).
    pub fn seed(website_id: crate::types::WebsiteId, seed_url: impl Into<String>) -> Self {
        Self::base(
            JobSpec::Templated { website_id },
            JobKind::SeedSubmission,
            seed_url,
        )
    }

    /// Job instance produced by a firing schedule. The schedule's config
    /// override is copied onto the job so the fired work is pinned to the
    /// override as it stood at fire time.
    pub fn from_schedule(
        schedule_id: ScheduleId,
        website_id: crate::types::WebsiteId,
        seed_url: impl Into<String>,
        config_override: Option<serde_json::Value>,
    ) -> Self {
        let mut job = Self::base(
            JobSpec::Templated { website_id },
            JobKind::Scheduled,
            seed_url,
        );
        job.schedule_id = Some(schedule_id);
        job.config_override = config_override;
        job
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Whether this job is a claim candidate at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.scheduled_at.map_or(true, |at| at <= now)
    }

    /// Whether cancellation is a legal transition from the current state.
    pub fn is_cancellable(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running)
    }
}
