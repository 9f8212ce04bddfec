//! In-memory store for tests and embedded use.
//!
//! All conditional writes happen under one mutex, giving the same
//! all-or-nothing semantics the Postgres implementation gets from
//! conditional UPDATEs.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{DeadLetterFilter, JobFilter, Store};
use crate::models::{CrawlJob, DeadLetterEntry, RetryHistory, RetryPolicy, ScheduledJob, Website};
use crate::types::{
    DeadLetterId, ErrorCategory, JobId, JobStatus, ResolutionState, ScheduleId, WebsiteId,
};

#[derive(Default)]
struct Inner {
    websites: HashMap<WebsiteId, Website>,
    schedules: HashMap<ScheduleId, ScheduledJob>,
    jobs: HashMap<JobId, CrawlJob>,
    retry_history: Vec<RetryHistory>,
    policies: HashMap<ErrorCategory, RetryPolicy>,
    dead_letters: HashMap<DeadLetterId, DeadLetterEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of jobs currently held, for test assertions.
    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_website(&self, website: &Website) -> Result<()> {
        self.lock().websites.insert(website.id, website.clone());
        Ok(())
    }

    async fn get_website(&self, id: WebsiteId) -> Result<Option<Website>> {
        Ok(self.lock().websites.get(&id).cloned())
    }

    async fn insert_schedule(&self, schedule: &ScheduledJob) -> Result<()> {
        self.lock().schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduledJob>> {
        Ok(self.lock().schedules.get(&id).cloned())
    }

    async fn set_schedule_active(&self, id: ScheduleId, active: bool) -> Result<()> {
        let mut inner = self.lock();
        if let Some(schedule) = inner.schedules.get_mut(&id) {
            schedule.active = active;
            schedule.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJob>> {
        let inner = self.lock();
        let mut due: Vec<_> = inner
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn fire_schedule(
        &self,
        schedule_id: ScheduleId,
        seen_next_run: DateTime<Utc>,
        new_next_run: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        job: &CrawlJob,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(schedule) = inner.schedules.get_mut(&schedule_id) else {
            return Ok(false);
        };
        // Optimistic concurrency: a concurrent pass already advanced it.
        if schedule.next_run_at != seen_next_run {
            return Ok(false);
        }
        schedule.next_run_at = new_next_run;
        schedule.last_run_at = Some(fired_at);
        schedule.updated_at = fired_at;
        inner.jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn insert_job(&self, job: &CrawlJob) -> Result<()> {
        self.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<CrawlJob>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<CrawlJob>> {
        let inner = self.lock();
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| {
                filter
                    .website_id
                    .map_or(true, |w| j.spec.website_id() == Some(w))
            })
            .filter(|j| filter.kind.map_or(true, |k| j.kind == k))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        if let Some(limit) = filter.limit {
            jobs.truncate(limit.max(0) as usize);
        }
        Ok(jobs)
    }

    async fn claim_jobs(
        &self,
        worker_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<CrawlJob>> {
        let mut inner = self.lock();
        let mut candidates: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .map(|j| j.id)
            .collect();
        candidates.sort_by(|a, b| {
            let ja = &inner.jobs[a];
            let jb = &inner.jobs[b];
            jb.priority
                .cmp(&ja.priority)
                .then(ja.created_at.cmp(&jb.created_at))
        });
        candidates.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let job = inner.jobs.get_mut(&id).expect("candidate id came from map");
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.worker_id = Some(worker_id.to_string());
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn update_progress(&self, id: JobId, progress: i64) -> Result<()> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.progress = job.progress.max(progress);
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete_job(&self, id: JobId, at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(at);
        job.updated_at = at;
        Ok(true)
    }

    async fn requeue_for_retry(
        &self,
        id: JobId,
        retry_count: i32,
        scheduled_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.status = JobStatus::Pending;
        job.retry_count = retry_count;
        job.scheduled_at = Some(scheduled_at);
        job.error_message = Some(error_message.to_string());
        job.worker_id = None;
        job.started_at = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_job_terminally(&self, id: JobId, error_message: &str) -> Result<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.error_message = Some(error_message.to_string());
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn cancel_job(&self, id: JobId, actor: &str, reason: &str) -> Result<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !job.is_cancellable() {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = JobStatus::Cancelled;
        job.cancelled_at = Some(now);
        job.cancelled_by = Some(actor.to_string());
        job.cancellation_reason = Some(reason.to_string());
        job.updated_at = now;
        Ok(true)
    }

    async fn stale_running_jobs(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CrawlJob>> {
        let inner = self.lock();
        let mut stale: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running && j.started_at.map_or(false, |at| at < cutoff)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.started_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn purge_terminal_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, j| !(j.status.is_terminal() && j.updated_at < older_than));
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn append_retry_history(&self, entry: &RetryHistory) -> Result<()> {
        self.lock().retry_history.push(entry.clone());
        Ok(())
    }

    async fn list_retry_history(&self, job_id: JobId) -> Result<Vec<RetryHistory>> {
        let inner = self.lock();
        let mut entries: Vec<_> = inner
            .retry_history
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.attempt);
        Ok(entries)
    }

    async fn upsert_policy(&self, policy: &RetryPolicy) -> Result<()> {
        self.lock().policies.insert(policy.category, policy.clone());
        Ok(())
    }

    async fn get_policy(&self, category: ErrorCategory) -> Result<Option<RetryPolicy>> {
        Ok(self.lock().policies.get(&category).cloned())
    }

    async fn list_policies(&self) -> Result<Vec<RetryPolicy>> {
        Ok(self.lock().policies.values().cloned().collect())
    }

    async fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> Result<bool> {
        let mut inner = self.lock();
        if inner.dead_letters.values().any(|e| e.job_id == entry.job_id) {
            return Ok(false);
        }
        inner.dead_letters.insert(entry.id, entry.clone());
        Ok(true)
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
        Ok(self.lock().dead_letters.get(&id).cloned())
    }

    async fn get_dead_letter_for_job(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>> {
        Ok(self
            .lock()
            .dead_letters
            .values()
            .find(|e| e.job_id == job_id)
            .cloned())
    }

    async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        let inner = self.lock();
        let mut entries: Vec<_> = inner
            .dead_letters
            .values()
            .filter(|e| filter.category.map_or(true, |c| e.category == c))
            .filter(|e| filter.website_id.map_or(true, |w| e.website_id == Some(w)))
            .filter(|e| filter.resolution.map_or(true, |r| e.resolution == r))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        if let Some(limit) = filter.limit {
            entries.truncate(limit.max(0) as usize);
        }
        Ok(entries)
    }

    async fn mark_manual_retry(&self, id: DeadLetterId, outcome: &str) -> Result<bool> {
        let mut inner = self.lock();
        let Some(entry) = inner.dead_letters.get_mut(&id) else {
            return Ok(false);
        };
        if entry.resolution == ResolutionState::Resolved {
            return Ok(false);
        }
        entry.resolution = ResolutionState::ManuallyRetried;
        entry.manual_retry_outcome = Some(outcome.to_string());
        Ok(true)
    }

    async fn resolve_dead_letter(
        &self,
        id: DeadLetterId,
        notes: Option<&str>,
        overwrite_notes: bool,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(entry) = inner.dead_letters.get_mut(&id) else {
            return Ok(false);
        };
        if entry.resolution == ResolutionState::Resolved {
            if overwrite_notes {
                entry.resolution_notes = notes.map(str::to_string);
            }
            return Ok(false);
        }
        entry.resolution = ResolutionState::Resolved;
        entry.resolution_notes = notes.map(str::to_string);
        entry.resolved_at = Some(Utc::now());
        Ok(true)
    }

    async fn bulk_resolve(&self, ids: &[DeadLetterId], notes: Option<&str>) -> Result<u64> {
        let mut changed = 0;
        for id in ids {
            if self.resolve_dead_letter(*id, notes, false).await? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn oldest_unresolved(&self) -> Result<Option<DeadLetterEntry>> {
        let inner = self.lock();
        Ok(inner
            .dead_letters
            .values()
            .filter(|e| e.resolution == ResolutionState::Unresolved)
            .min_by_key(|e| e.created_at)
            .cloned())
    }
}
