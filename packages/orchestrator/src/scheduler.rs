//! Recurring scheduler: turns due schedules into crawl jobs.
//!
//! Safe to run on several instances at once. Each fire is an atomic
//! compare-and-advance on the schedule's `next_run_at`, so concurrent
//! instances observing the same due schedule produce exactly one job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::models::CrawlJob;
use crate::schedule_expr;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum due schedules examined per pass.
    pub batch_size: i64,
    /// How long to sleep between passes.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_secs(15),
        }
    }
}

/// Outcome of one scheduler pass, mostly for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// Schedules this instance fired.
    pub fired: usize,
    /// Due schedules another instance fired first.
    pub lost_races: usize,
    /// Schedules whose recurrence no longer yields a future fire;
    /// deactivated.
    pub exhausted: usize,
}

pub struct RecurringScheduler {
    store: Arc<dyn Store>,
    config: SchedulerConfig,
    shutdown: Arc<AtomicBool>,
}

impl RecurringScheduler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_config(store, SchedulerConfig::default())
    }

    pub fn with_config(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Poll until shutdown is requested.
    pub async fn run(self) -> Result<()> {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "recurring scheduler starting"
        );

        loop {
            if self.is_shutdown_requested() {
                break;
            }

            match self.run_once(Utc::now()).await {
                Ok(outcome) if outcome.fired > 0 || outcome.lost_races > 0 => {
                    debug!(
                        fired = outcome.fired,
                        lost_races = outcome.lost_races,
                        exhausted = outcome.exhausted,
                        "scheduler pass complete"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "scheduler pass failed");
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        info!("recurring scheduler stopped");
        Ok(())
    }

    /// One pass: select due schedules and fire each one.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<PassOutcome> {
        let due = self
            .store
            .due_schedules(now, self.config.batch_size)
            .await
            .context("failed to select due schedules")?;

        let mut outcome = PassOutcome::default();
        for schedule in due {
            let next = match schedule_expr::next_fire_after(&schedule.recurrence, now) {
                Ok(next) => next,
                Err(schedule_expr::ScheduleError::Exhausted { .. }) => {
                    warn!(
                        schedule_id = %schedule.id,
                        recurrence = %schedule.recurrence,
                        "recurrence has no future fire, deactivating schedule"
                    );
                    self.store.set_schedule_active(schedule.id, false).await?;
                    outcome.exhausted += 1;
                    continue;
                }
                Err(e) => {
                    // Validated at creation; a corrupt row should not stall
                    // the rest of the batch.
                    error!(schedule_id = %schedule.id, error = %e, "unparseable recurrence");
                    self.store.set_schedule_active(schedule.id, false).await?;
                    outcome.exhausted += 1;
                    continue;
                }
            };

            let website = match self.store.get_website(schedule.website_id).await? {
                Some(website) if website.is_crawlable() => website,
                Some(_) | None => {
                    warn!(
                        schedule_id = %schedule.id,
                        website_id = %schedule.website_id,
                        "schedule points at a missing or inactive website, deactivating"
                    );
                    self.store.set_schedule_active(schedule.id, false).await?;
                    outcome.exhausted += 1;
                    continue;
                }
            };

            let job = CrawlJob::from_schedule(
                schedule.id,
                schedule.website_id,
                &website.base_url,
                schedule.config_override.clone(),
            );
            let fired = self
                .store
                .fire_schedule(schedule.id, schedule.next_run_at, next, now, &job)
                .await
                .with_context(|| format!("failed to fire schedule {}", schedule.id))?;

            if fired {
                info!(
                    schedule_id = %schedule.id,
                    job_id = %job.id,
                    next_run_at = %next,
                    "schedule fired"
                );
                outcome.fired += 1;
            } else {
                debug!(schedule_id = %schedule.id, "schedule already advanced by another instance");
                outcome.lost_races += 1;
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScheduledJob, Website};
    use crate::store::{JobFilter, MemoryStore};
    use crate::types::{JobKind, JobStatus, WebsiteId};
    use chrono::TimeZone;

    async fn seeded_store() -> (Arc<MemoryStore>, ScheduledJob) {
        let store = Arc::new(MemoryStore::new());
        let website = Website::new("example", "https://example.com", serde_json::json!({}));
        store.insert_website(&website).await.unwrap();

        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        // Hourly on the hour; first fire 13:00.
        let schedule = ScheduledJob::new(website.id, "0 0 * * * *", created).unwrap();
        store.insert_schedule(&schedule).await.unwrap();
        (store, schedule)
    }

    #[tokio::test]
    async fn due_schedule_fires_one_job_and_advances() {
        let (store, schedule) = seeded_store().await;
        let scheduler = RecurringScheduler::new(store.clone());

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 30).unwrap();
        let outcome = scheduler.run_once(now).await.unwrap();
        assert_eq!(outcome.fired, 1);

        let jobs = store.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Scheduled);
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(jobs[0].schedule_id, Some(schedule.id));

        let advanced = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(
            advanced.next_run_at,
            Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 0).unwrap()
        );
        assert_eq!(advanced.last_run_at, Some(now));
    }

    #[tokio::test]
    async fn second_pass_at_same_instant_fires_nothing() {
        let (store, _) = seeded_store().await;
        let scheduler = RecurringScheduler::new(store.clone());

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 30).unwrap();
        scheduler.run_once(now).await.unwrap();
        let second = scheduler.run_once(now).await.unwrap();
        assert_eq!(second.fired, 0);

        let jobs = store.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_passes_produce_exactly_one_job() {
        let (store, _) = seeded_store().await;
        let a = RecurringScheduler::new(store.clone());
        let b = RecurringScheduler::new(store.clone());

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 30).unwrap();
        let (ra, rb) = tokio::join!(a.run_once(now), b.run_once(now));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.fired + rb.fired, 1);

        let jobs = store.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn undue_schedule_is_left_alone() {
        let (store, _) = seeded_store().await;
        let scheduler = RecurringScheduler::new(store.clone());

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let outcome = scheduler.run_once(now).await.unwrap();
        assert_eq!(outcome, PassOutcome::default());
        assert!(store.list_jobs(&JobFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inactive_schedule_never_fires() {
        let (store, schedule) = seeded_store().await;
        store.set_schedule_active(schedule.id, false).await.unwrap();
        let scheduler = RecurringScheduler::new(store.clone());

        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let outcome = scheduler.run_once(now).await.unwrap();
        assert_eq!(outcome.fired, 0);
        assert!(store.list_jobs(&JobFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fired_job_snapshots_the_schedule_config_override() {
        let store = Arc::new(MemoryStore::new());
        let website = Website::new("example", "https://example.com", serde_json::json!({}));
        store.insert_website(&website).await.unwrap();

        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let schedule = ScheduledJob::new(website.id, "0 0 * * * *", created)
            .unwrap()
            .with_config_override(serde_json::json!({"max_depth": 2}));
        store.insert_schedule(&schedule).await.unwrap();

        let scheduler = RecurringScheduler::new(store.clone());
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 30).unwrap();
        scheduler.run_once(now).await.unwrap();

        let jobs = store.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(
            jobs[0].config_override,
            Some(serde_json::json!({"max_depth": 2}))
        );

        // A later edit to the schedule's override must not reach the job
        // that already fired.
        let mut edited = store.get_schedule(schedule.id).await.unwrap().unwrap();
        edited.config_override = Some(serde_json::json!({"max_depth": 9}));
        store.insert_schedule(&edited).await.unwrap();

        let job = store.get_job(jobs[0].id).await.unwrap().unwrap();
        assert_eq!(
            job.config_override,
            Some(serde_json::json!({"max_depth": 2}))
        );
    }

    #[tokio::test]
    async fn missed_fires_collapse_into_a_single_run() {
        let (store, schedule) = seeded_store().await;
        let scheduler = RecurringScheduler::new(store.clone());

        // Scheduler was down for six hours; only one catch-up job fires and
        // the schedule jumps to the next future instant.
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 19, 0, 30).unwrap();
        let outcome = scheduler.run_once(now).await.unwrap();
        assert_eq!(outcome.fired, 1);

        let jobs = store.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);

        let advanced = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(
            advanced.next_run_at,
            Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap()
        );
    }
}
