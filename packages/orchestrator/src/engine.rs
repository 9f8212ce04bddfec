//! Job lifecycle engine: claiming, state transitions, retry, escalation.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::backoff;
use crate::models::{CrawlJob, DeadLetterEntry, RetryHistory, RetryPolicy};
use crate::store::Store;
use crate::types::{ErrorCategory, FetchFailure, JobId, JobSpec, JobStatus, Priority};

/// Submission request from the administrative layer.
///
/// The template-or-inline choice is carried by [`JobSpec`], so an invalid
/// combination is unrepresentable.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub spec: JobSpec,
    pub seed_url: String,
    pub priority: Priority,
    pub max_retries: Option<i32>,
    /// Earliest instant the job may run; immediate when unset.
    pub run_at: Option<DateTime<Utc>>,
}

impl SubmitRequest {
    pub fn new(spec: JobSpec, seed_url: impl Into<String>) -> Self {
        Self {
            spec,
            seed_url: seed_url.into(),
            priority: 0,
            max_retries: None,
            run_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// What the engine decided to do with a failed job.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// Requeued as pending; re-enters candidacy at `next_run_at`.
    Retried {
        attempt: i32,
        delay: Duration,
        next_run_at: DateTime<Utc>,
    },
    /// Permanently abandoned and handed to the dead letter pipeline.
    /// `newly_escalated` is false when an entry for the job already existed.
    DeadLettered { newly_escalated: bool },
}

pub struct JobEngine {
    store: Arc<dyn Store>,
}

impl JobEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Accept a job from the administrative layer and enqueue it pending.
    pub async fn submit(&self, request: SubmitRequest) -> Result<CrawlJob> {
        if let Some(website_id) = request.spec.website_id() {
            let website = self
                .store
                .get_website(website_id)
                .await?
                .ok_or_else(|| anyhow!("website {website_id} does not exist"))?;
            if !website.is_crawlable() {
                return Err(anyhow!("website {website_id} is not active"));
            }
        }

        let mut job = match request.spec {
            JobSpec::Templated { website_id } => CrawlJob::one_time(website_id, request.seed_url),
            JobSpec::Inline { config } => CrawlJob::inline(config, request.seed_url),
        }
        .with_priority(request.priority);
        if let Some(max_retries) = request.max_retries {
            job = job.with_max_retries(max_retries);
        }
        if let Some(run_at) = request.run_at {
            job = job.scheduled_for(run_at);
        }

        self.store.insert_job(&job).await?;
        info!(job_id = %job.id, kind = job.kind.as_str(), priority = job.priority, "job submitted");
        Ok(job)
    }

    /// Claim up to `limit` due jobs for a worker. At most one worker ever
    /// claims a given job; losing claimers simply receive fewer jobs.
    pub async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<CrawlJob>> {
        let claimed = self.store.claim_jobs(worker_id, limit, Utc::now()).await?;
        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }

    /// Monotonic progress report; never changes status.
    pub async fn report_progress(&self, job_id: JobId, progress: i64) -> Result<()> {
        self.store.update_progress(job_id, progress).await
    }

    /// Running → Completed.
    pub async fn complete(&self, job_id: JobId) -> Result<()> {
        let transitioned = self.store.complete_job(job_id, Utc::now()).await?;
        if !transitioned {
            return Err(anyhow!("job {job_id} is not running, cannot complete"));
        }
        info!(job_id = %job_id, "job completed");
        Ok(())
    }

    /// Handle a failure reported by the fetcher: record the attempt, then
    /// either requeue with backoff or escalate to the dead letter pipeline.
    ///
    /// Only running jobs accept a failure report. A report for an
    /// already-failed job re-runs the idempotent escalation without
    /// recording the attempt twice; anything else is an error.
    pub async fn fail(&self, job_id: JobId, failure: FetchFailure) -> Result<FailureDisposition> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {job_id} does not exist"))?;

        match job.status {
            JobStatus::Running => {}
            JobStatus::Failed => {
                return self.escalate(&job, &failure, job.retry_count + 1).await;
            }
            other => {
                return Err(anyhow!(
                    "job {job_id} is {}, cannot record a failure",
                    other.as_str()
                ));
            }
        }

        let policy = self.policy_for(failure.category).await?;
        let attempt = job.retry_count + 1;
        let effective_max = policy.max_attempts.min(job.max_retries);
        let give_up = !policy.retryable || attempt > effective_max;

        if give_up {
            let abandoned = self
                .store
                .fail_job_terminally(job.id, &failure.message)
                .await?;
            if !abandoned {
                return Err(anyhow!("job {job_id} is no longer running, cannot fail"));
            }
            self.store
                .append_retry_history(&RetryHistory::record(
                    job.id,
                    attempt,
                    failure.category,
                    &failure.message,
                    failure.stack_trace.clone(),
                    None,
                ))
                .await?;
            return self.escalate(&job, &failure, attempt).await;
        }

        let delay = backoff::compute_delay(&policy, attempt);
        let next_run_at = Utc::now() + delay;
        let requeued = self
            .store
            .requeue_for_retry(job.id, attempt, next_run_at, &failure.message)
            .await?;
        if !requeued {
            return Err(anyhow!("job {job_id} is no longer running, cannot requeue"));
        }
        self.store
            .append_retry_history(&RetryHistory::record(
                job.id,
                attempt,
                failure.category,
                &failure.message,
                failure.stack_trace.clone(),
                Some(delay.num_seconds()),
            ))
            .await?;

        warn!(
            job_id = %job.id,
            category = failure.category.as_str(),
            attempt,
            delay_secs = delay.num_seconds(),
            "job failed, retrying with backoff"
        );
        Ok(FailureDisposition::Retried {
            attempt,
            delay,
            next_run_at,
        })
    }

    /// Cancel a pending or running job. Cooperative for running jobs: the
    /// record flips immediately, the fetcher is expected to observe the
    /// state and stop.
    pub async fn cancel(&self, job_id: JobId, actor: &str, reason: &str) -> Result<bool> {
        let cancelled = self.store.cancel_job(job_id, actor, reason).await?;
        if cancelled {
            info!(job_id = %job_id, actor, reason, "job cancelled");
        } else {
            debug!(job_id = %job_id, "cancel was a no-op, job already terminal");
        }
        Ok(cancelled)
    }

    /// Treat jobs stuck in `running` longer than `staleness` as having
    /// failed with an execution timeout, routing them through the normal
    /// retry path.
    pub async fn recover_stale(&self, staleness: Duration, limit: i64) -> Result<usize> {
        let cutoff = Utc::now() - staleness;
        let stale = self.store.stale_running_jobs(cutoff, limit).await?;
        let mut recovered = 0;
        for job in stale {
            warn!(
                job_id = %job.id,
                started_at = ?job.started_at,
                "running job exceeded staleness threshold"
            );
            let failure = FetchFailure::new(
                ErrorCategory::ExecutionTimeout,
                format!("job exceeded staleness threshold of {}s", staleness.num_seconds()),
            );
            self.fail(job.id, failure)
                .await
                .with_context(|| format!("failed to recover stale job {}", job.id))?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Drop terminal jobs older than the retention window.
    pub async fn purge_terminal(&self, retention: Duration) -> Result<u64> {
        let purged = self
            .store
            .purge_terminal_jobs(Utc::now() - retention)
            .await?;
        if purged > 0 {
            info!(purged, "purged terminal jobs past retention");
        }
        Ok(purged)
    }

    /// Insert the dead letter entry for an already-failed job. Idempotent
    /// per job id; the Running → Failed transition happens in [`Self::fail`]
    /// before this runs.
    async fn escalate(
        &self,
        job: &CrawlJob,
        failure: &FetchFailure,
        attempt: i32,
    ) -> Result<FailureDisposition> {
        let entry = DeadLetterEntry::from_failure(
            job.id,
            job.spec.website_id(),
            failure,
            attempt,
            job.created_at,
        );
        let newly_escalated = self.store.insert_dead_letter(&entry).await?;

        if newly_escalated {
            warn!(
                job_id = %job.id,
                category = failure.category.as_str(),
                attempt_count = attempt,
                "job escalated to dead letter pipeline"
            );
        } else {
            debug!(job_id = %job.id, "dead letter entry already exists, escalation was a no-op");
        }
        Ok(FailureDisposition::DeadLettered { newly_escalated })
    }

    /// Policy for a category: the administratively configured row when one
    /// exists, the built-in default otherwise.
    async fn policy_for(&self, category: ErrorCategory) -> Result<RetryPolicy> {
        Ok(self
            .store
            .get_policy(category)
            .await?
            .unwrap_or_else(|| RetryPolicy::default_for(category)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Website;
    use crate::store::MemoryStore;
    use crate::types::JobStatus;

    fn engine() -> JobEngine {
        JobEngine::new(Arc::new(MemoryStore::new()))
    }

    async fn submit_inline(engine: &JobEngine) -> CrawlJob {
        engine
            .submit(SubmitRequest::new(
                JobSpec::Inline {
                    config: serde_json::json!({"depth": 1}),
                },
                "https://example.com/",
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn submit_templated_requires_existing_website() {
        let engine = engine();
        let request = SubmitRequest::new(
            JobSpec::Templated {
                website_id: crate::types::WebsiteId::new(),
            },
            "https://example.com/",
        );
        assert!(engine.submit(request).await.is_err());
    }

    #[tokio::test]
    async fn submit_templated_succeeds_for_active_website() {
        let engine = engine();
        let website = Website::new("example", "https://example.com", serde_json::json!({}));
        engine.store().insert_website(&website).await.unwrap();

        let job = engine
            .submit(SubmitRequest::new(
                JobSpec::Templated {
                    website_id: website.id,
                },
                "https://example.com/",
            ))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn claim_then_complete_reaches_terminal_state() {
        let engine = engine();
        let job = submit_inline(&engine).await;

        let claimed = engine.claim("worker-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);
        assert_eq!(claimed[0].status, JobStatus::Running);

        engine.complete(job.id).await.unwrap();
        let stored = engine.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn completing_a_pending_job_is_an_error() {
        let engine = engine();
        let job = submit_inline(&engine).await;
        assert!(engine.complete(job.id).await.is_err());
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_backoff() {
        let engine = engine();
        let job = submit_inline(&engine).await;
        engine.claim("worker-1", 1).await.unwrap();

        let before = Utc::now();
        let disposition = engine
            .fail(
                job.id,
                FetchFailure::new(ErrorCategory::TransientNetwork, "connection reset"),
            )
            .await
            .unwrap();

        match disposition {
            FailureDisposition::Retried {
                attempt,
                delay,
                next_run_at,
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::seconds(30));
                assert!(next_run_at >= before + delay);
            }
            other => panic!("expected retry, got {other:?}"),
        }

        let stored = engine.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.scheduled_at.unwrap() > before);

        let history = engine.store().list_retry_history(job.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attempt, 1);
        assert_eq!(history[0].delay_secs, Some(30));
    }

    #[tokio::test]
    async fn requeued_job_is_not_claimable_until_delay_elapses() {
        let engine = engine();
        let job = submit_inline(&engine).await;
        engine.claim("worker-1", 1).await.unwrap();
        engine
            .fail(
                job.id,
                FetchFailure::new(ErrorCategory::TransientNetwork, "reset"),
            )
            .await
            .unwrap();

        // Immediately after the failure the backoff window is still open.
        assert!(engine.claim("worker-2", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_exactly_once() {
        let engine = engine();
        let job = submit_inline(&engine).await;
        engine.claim("worker-1", 1).await.unwrap();

        let disposition = engine
            .fail(
                job.id,
                FetchFailure::new(ErrorCategory::PermanentNotFound, "gone")
                    .with_http_status(404),
            )
            .await
            .unwrap();
        assert_eq!(
            disposition,
            FailureDisposition::DeadLettered {
                newly_escalated: true
            }
        );

        let stored = engine.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);

        let entry = engine
            .store()
            .get_dead_letter_for_job(job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.category, ErrorCategory::PermanentNotFound);
        assert_eq!(entry.http_status, Some(404));

        // The job never re-enters pending.
        assert!(engine.claim("worker-2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_escalation_for_the_same_job_is_a_noop() {
        let engine = engine();
        let job = submit_inline(&engine).await;
        engine.claim("worker-1", 1).await.unwrap();

        let failure = FetchFailure::new(ErrorCategory::Authentication, "denied");
        engine.fail(job.id, failure.clone()).await.unwrap();

        // A duplicate report for the already-failed job must not create a
        // second entry or a second history row for the same attempt.
        let stored = engine.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let again = engine.fail(job.id, failure).await.unwrap();
        assert_eq!(
            again,
            FailureDisposition::DeadLettered {
                newly_escalated: false
            }
        );
        let history = engine.store().list_retry_history(job.id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn failure_report_for_unclaimed_job_is_rejected() {
        let engine = engine();
        let job = submit_inline(&engine).await;

        // Never claimed, so there is no attempt to record.
        let result = engine
            .fail(
                job.id,
                FetchFailure::new(ErrorCategory::PermanentNotFound, "gone"),
            )
            .await;
        assert!(result.is_err());

        // No side effects: no dead letter entry, no history, and the job
        // remains an ordinary pending claim candidate.
        assert!(engine
            .store()
            .get_dead_letter_for_job(job.id)
            .await
            .unwrap()
            .is_none());
        assert!(engine
            .store()
            .list_retry_history(job.id)
            .await
            .unwrap()
            .is_empty());
        let claimed = engine.claim("worker-1", 1).await.unwrap();
        assert_eq!(claimed[0].id, job.id);
    }

    #[tokio::test]
    async fn failure_report_for_completed_job_is_rejected() {
        let engine = engine();
        let job = submit_inline(&engine).await;
        engine.claim("worker-1", 1).await.unwrap();
        engine.complete(job.id).await.unwrap();

        let result = engine
            .fail(
                job.id,
                FetchFailure::new(ErrorCategory::TransientNetwork, "late report"),
            )
            .await;
        assert!(result.is_err());
        let stored = engine.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn retries_exhaust_into_dead_letter() {
        let engine = engine();
        let job = submit_inline(&engine).await;

        let mut disposition = None;
        for _ in 0..=3 {
            let claimed = loop {
                let claimed = engine.claim("worker-1", 1).await.unwrap();
                if !claimed.is_empty() {
                    break claimed;
                }
                // Clear the backoff window so the next claim sees the job.
                let mut stored = engine.store().get_job(job.id).await.unwrap().unwrap();
                stored.scheduled_at = Some(Utc::now() - Duration::seconds(1));
                engine.store().insert_job(&stored).await.unwrap();
            };
            assert_eq!(claimed[0].id, job.id);
            disposition = Some(
                engine
                    .fail(
                        job.id,
                        FetchFailure::new(ErrorCategory::TransientNetwork, "reset"),
                    )
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(
            disposition.unwrap(),
            FailureDisposition::DeadLettered {
                newly_escalated: true
            }
        );
        let history = engine.store().list_retry_history(job.id).await.unwrap();
        assert_eq!(history.len(), 4);
        let attempts: Vec<i32> = history.iter().map(|h| h.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn cancel_pending_job_records_actor_and_reason() {
        let engine = engine();
        let job = submit_inline(&engine).await;

        assert!(engine.cancel(job.id, "operator", "duplicate submission").await.unwrap());
        let stored = engine.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.cancelled_by.as_deref(), Some("operator"));
        assert_eq!(stored.cancellation_reason.as_deref(), Some("duplicate submission"));
        assert!(stored.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn cancel_completed_job_is_a_noop() {
        let engine = engine();
        let job = submit_inline(&engine).await;
        engine.claim("worker-1", 1).await.unwrap();
        engine.complete(job.id).await.unwrap();

        assert!(!engine.cancel(job.id, "operator", "too late").await.unwrap());
        let stored = engine.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn stale_running_jobs_are_recovered_as_timeouts() {
        let engine = engine();
        let job = submit_inline(&engine).await;
        engine.claim("worker-1", 1).await.unwrap();

        // Backdate the start so the job crosses the staleness threshold.
        let mut stored = engine.store().get_job(job.id).await.unwrap().unwrap();
        stored.started_at = Some(Utc::now() - Duration::minutes(30));
        engine.store().insert_job(&stored).await.unwrap();

        let recovered = engine.recover_stale(Duration::minutes(10), 100).await.unwrap();
        assert_eq!(recovered, 1);

        let stored = engine.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        let history = engine.store().list_retry_history(job.id).await.unwrap();
        assert_eq!(history[0].category, ErrorCategory::ExecutionTimeout);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_status_neutral() {
        let engine = engine();
        let job = submit_inline(&engine).await;
        engine.claim("worker-1", 1).await.unwrap();

        engine.report_progress(job.id, 10).await.unwrap();
        engine.report_progress(job.id, 5).await.unwrap();

        let stored = engine.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 10);
        assert_eq!(stored.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn priority_orders_claims_before_creation_time() {
        let engine = engine();
        let low = submit_inline(&engine).await;
        let high = engine
            .submit(
                SubmitRequest::new(
                    JobSpec::Inline {
                        config: serde_json::json!({}),
                    },
                    "https://example.com/high",
                )
                .with_priority(10),
            )
            .await
            .unwrap();

        let claimed = engine.claim("worker-1", 2).await.unwrap();
        assert_eq!(claimed[0].id, high.id);
        assert_eq!(claimed[1].id, low.id);
    }

    #[tokio::test]
    async fn purge_drops_only_old_terminal_jobs() {
        let engine = engine();
        let done = submit_inline(&engine).await;
        let live = submit_inline(&engine).await;
        engine.claim("worker-1", 1).await.unwrap();
        engine.complete(done.id).await.unwrap();

        // Age the completed job beyond the retention window.
        let mut stored = engine.store().get_job(done.id).await.unwrap().unwrap();
        stored.updated_at = Utc::now() - Duration::days(60);
        engine.store().insert_job(&stored).await.unwrap();

        let purged = engine.purge_terminal(Duration::days(30)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(engine.store().get_job(done.id).await.unwrap().is_none());
        assert!(engine.store().get_job(live.id).await.unwrap().is_some());
    }
}
