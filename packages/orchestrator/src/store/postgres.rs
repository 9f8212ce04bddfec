//! PostgreSQL store implementation.
//!
//! All coordination points are expressed as conditional writes: the claim
//! uses a `FOR UPDATE SKIP LOCKED` CTE, the schedule advance is guarded by
//! the `next_run_at` value the scheduler read, and dead letter creation
//! relies on the unique job_id constraint.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{DeadLetterFilter, JobFilter, Store};
use crate::models::{CrawlJob, DeadLetterEntry, RetryHistory, RetryPolicy, ScheduledJob, Website};
use crate::types::{
    DeadLetterId, ErrorCategory, JobId, JobSpec, RetryAttemptId, ScheduleId, WebsiteId,
};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the orchestration tables if they do not exist.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS websites (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                base_url TEXT NOT NULL,
                config JSONB NOT NULL DEFAULT '{}',
                default_schedule TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                deleted_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create websites table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id UUID PRIMARY KEY,
                website_id UUID NOT NULL REFERENCES websites(id),
                recurrence TEXT NOT NULL,
                next_run_at TIMESTAMPTZ NOT NULL,
                last_run_at TIMESTAMPTZ,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                config_override JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create scheduled_jobs table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_due \
             ON scheduled_jobs(next_run_at) WHERE active",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create scheduled_jobs index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS crawl_jobs (
                id UUID PRIMARY KEY,
                website_id UUID REFERENCES websites(id),
                inline_config JSONB,
                kind TEXT NOT NULL,
                seed_url TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                progress BIGINT NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                schedule_id UUID REFERENCES scheduled_jobs(id),
                config_override JSONB,
                scheduled_at TIMESTAMPTZ,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                cancelled_at TIMESTAMPTZ,
                error_message TEXT,
                cancellation_reason TEXT,
                cancelled_by TEXT,
                worker_id TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CHECK ((website_id IS NULL) <> (inline_config IS NULL))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create crawl_jobs table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_crawl_jobs_claim \
             ON crawl_jobs(priority DESC, created_at ASC) WHERE status = 'pending'",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create crawl_jobs claim index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retry_history (
                id UUID PRIMARY KEY,
                job_id UUID NOT NULL REFERENCES crawl_jobs(id) ON DELETE CASCADE,
                attempt INTEGER NOT NULL,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                stack_trace TEXT,
                delay_secs BIGINT,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create retry_history table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_retry_history_job ON retry_history(job_id, attempt)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create retry_history index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retry_policies (
                category TEXT PRIMARY KEY,
                retryable BOOLEAN NOT NULL,
                max_attempts INTEGER NOT NULL,
                backoff TEXT NOT NULL,
                initial_delay_secs BIGINT NOT NULL,
                max_delay_secs BIGINT NOT NULL,
                backoff_multiplier DOUBLE PRECISION NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create retry_policies table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letter_entries (
                id UUID PRIMARY KEY,
                job_id UUID NOT NULL UNIQUE,
                website_id UUID,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                stack_trace TEXT,
                http_status INTEGER,
                attempt_count INTEGER NOT NULL,
                first_attempt_at TIMESTAMPTZ NOT NULL,
                last_attempt_at TIMESTAMPTZ NOT NULL,
                resolution TEXT NOT NULL DEFAULT 'unresolved',
                resolution_notes TEXT,
                manual_retry_outcome TEXT,
                resolved_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create dead_letter_entries table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dead_letter_unresolved \
             ON dead_letter_entries(created_at) WHERE resolution <> 'resolved'",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create dead_letter_entries index")?;

        Ok(())
    }
}

const JOB_COLUMNS: &str = "id, website_id, inline_config, kind, seed_url, priority, status, \
     progress, retry_count, max_retries, schedule_id, config_override, scheduled_at, started_at, \
     completed_at, cancelled_at, error_message, cancellation_reason, cancelled_by, worker_id, \
     created_at, updated_at";

fn website_from_row(r: &PgRow) -> Result<Website> {
    Ok(Website {
        id: WebsiteId(r.get("id")),
        name: r.get("name"),
        base_url: r.get("base_url"),
        config: r.get("config"),
        default_schedule: r.get("default_schedule"),
        status: r.get::<String, _>("status").parse()?,
        deleted_at: r.get("deleted_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn schedule_from_row(r: &PgRow) -> Result<ScheduledJob> {
    Ok(ScheduledJob {
        id: ScheduleId(r.get("id")),
        website_id: WebsiteId(r.get("website_id")),
        recurrence: r.get("recurrence"),
        next_run_at: r.get("next_run_at"),
        last_run_at: r.get("last_run_at"),
        active: r.get("active"),
        config_override: r.get("config_override"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn job_from_row(r: &PgRow) -> Result<CrawlJob> {
    let website_id: Option<Uuid> = r.get("website_id");
    let inline_config: Option<serde_json::Value> = r.get("inline_config");
    let spec = match (website_id, inline_config) {
        (Some(id), None) => JobSpec::Templated {
            website_id: WebsiteId(id),
        },
        (None, Some(config)) => JobSpec::Inline { config },
        (got_site, got_config) => bail!(
            "crawl job row violates the template-xor-inline constraint \
             (website_id present: {}, inline_config present: {})",
            got_site.is_some(),
            got_config.is_some(),
        ),
    };
    Ok(CrawlJob {
        id: JobId(r.get("id")),
        spec,
        kind: r.get::<String, _>("kind").parse()?,
        seed_url: r.get("seed_url"),
        priority: r.get("priority"),
        status: r.get::<String, _>("status").parse()?,
        progress: r.get("progress"),
        retry_count: r.get("retry_count"),
        max_retries: r.get("max_retries"),
        schedule_id: r.get::<Option<Uuid>, _>("schedule_id").map(ScheduleId),
        config_override: r.get("config_override"),
        scheduled_at: r.get("scheduled_at"),
        started_at: r.get("started_at"),
        completed_at: r.get("completed_at"),
        cancelled_at: r.get("cancelled_at"),
        error_message: r.get("error_message"),
        cancellation_reason: r.get("cancellation_reason"),
        cancelled_by: r.get("cancelled_by"),
        worker_id: r.get("worker_id"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn retry_history_from_row(r: &PgRow) -> Result<RetryHistory> {
    Ok(RetryHistory {
        id: RetryAttemptId(r.get("id")),
        job_id: JobId(r.get("job_id")),
        attempt: r.get("attempt"),
        category: r.get::<String, _>("category").parse()?,
        message: r.get("message"),
        stack_trace: r.get("stack_trace"),
        delay_secs: r.get("delay_secs"),
        recorded_at: r.get("recorded_at"),
    })
}

fn policy_from_row(r: &PgRow) -> Result<RetryPolicy> {
    Ok(RetryPolicy {
        category: r.get::<String, _>("category").parse()?,
        retryable: r.get("retryable"),
        max_attempts: r.get("max_attempts"),
        backoff: r.get::<String, _>("backoff").parse()?,
        initial_delay_secs: r.get("initial_delay_secs"),
        max_delay_secs: r.get("max_delay_secs"),
        backoff_multiplier: r.get("backoff_multiplier"),
        updated_at: r.get("updated_at"),
    })
}

fn dead_letter_from_row(r: &PgRow) -> Result<DeadLetterEntry> {
    Ok(DeadLetterEntry {
        id: DeadLetterId(r.get("id")),
        job_id: JobId(r.get("job_id")),
        website_id: r.get::<Option<Uuid>, _>("website_id").map(WebsiteId),
        category: r.get::<String, _>("category").parse()?,
        message: r.get("message"),
        stack_trace: r.get("stack_trace"),
        http_status: r.get("http_status"),
        attempt_count: r.get("attempt_count"),
        first_attempt_at: r.get("first_attempt_at"),
        last_attempt_at: r.get("last_attempt_at"),
        resolution: r.get::<String, _>("resolution").parse()?,
        resolution_notes: r.get("resolution_notes"),
        manual_retry_outcome: r.get("manual_retry_outcome"),
        resolved_at: r.get("resolved_at"),
        created_at: r.get("created_at"),
    })
}

async fn insert_job_with<'e, E>(executor: E, job: &CrawlJob) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO crawl_jobs (
            id, website_id, inline_config, kind, seed_url, priority, status,
            progress, retry_count, max_retries, schedule_id, config_override,
            scheduled_at, started_at, completed_at, cancelled_at, error_message,
            cancellation_reason, cancelled_by, worker_id, created_at, updated_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
            $13, $14, $15, $16, $17, $18, $19, $20, $21, $22
        )
        "#,
    )
    .bind(job.id.0)
    .bind(job.spec.website_id().map(|w| w.0))
    .bind(job.spec.inline_config())
    .bind(job.kind.as_str())
    .bind(&job.seed_url)
    .bind(job.priority)
    .bind(job.status.as_str())
    .bind(job.progress)
    .bind(job.retry_count)
    .bind(job.max_retries)
    .bind(job.schedule_id.map(|s| s.0))
    .bind(&job.config_override)
    .bind(job.scheduled_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.cancelled_at)
    .bind(&job.error_message)
    .bind(&job.cancellation_reason)
    .bind(&job.cancelled_by)
    .bind(&job.worker_id)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(executor)
    .await
    .context("Failed to insert crawl job")?;
    Ok(())
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_website(&self, website: &Website) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO websites (
                id, name, base_url, config, default_schedule, status,
                deleted_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(website.id.0)
        .bind(&website.name)
        .bind(&website.base_url)
        .bind(&website.config)
        .bind(&website.default_schedule)
        .bind(website.status.as_str())
        .bind(website.deleted_at)
        .bind(website.created_at)
        .bind(website.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert website")?;
        Ok(())
    }

    async fn get_website(&self, id: WebsiteId) -> Result<Option<Website>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, base_url, config, default_schedule, status,
                   deleted_at, created_at, updated_at
            FROM websites
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get website")?;

        row.as_ref().map(website_from_row).transpose()
    }

    async fn insert_schedule(&self, schedule: &ScheduledJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (
                id, website_id, recurrence, next_run_at, last_run_at,
                active, config_override, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(schedule.id.0)
        .bind(schedule.website_id.0)
        .bind(&schedule.recurrence)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.active)
        .bind(&schedule.config_override)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert schedule")?;
        Ok(())
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduledJob>> {
        let row = sqlx::query(
            r#"
            SELECT id, website_id, recurrence, next_run_at, last_run_at,
                   active, config_override, created_at, updated_at
            FROM scheduled_jobs
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get schedule")?;

        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn set_schedule_active(&self, id: ScheduleId, active: bool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET active = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(active)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .context("Failed to toggle schedule")?;
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, website_id, recurrence, next_run_at, last_run_at,
                   active, config_override, created_at, updated_at
            FROM scheduled_jobs
            WHERE active = TRUE AND next_run_at <= $1
            ORDER BY next_run_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list due schedules")?;

        rows.iter().map(schedule_from_row).collect()
    }

    async fn fire_schedule(
        &self,
        schedule_id: ScheduleId,
        seen_next_run: DateTime<Utc>,
        new_next_run: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        job: &CrawlJob,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        // Guarded advance: succeeds only if next_run_at is still the value
        // the scheduler read, so one firing instant produces one job.
        let advanced = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET next_run_at = $1, last_run_at = $2, updated_at = NOW()
            WHERE id = $3 AND next_run_at = $4
            "#,
        )
        .bind(new_next_run)
        .bind(fired_at)
        .bind(schedule_id.0)
        .bind(seen_next_run)
        .execute(&mut *tx)
        .await
        .context("Failed to advance schedule")?
        .rows_affected();

        if advanced == 0 {
            tx.rollback().await.ok();
            return Ok(false);
        }

        insert_job_with(&mut *tx, job).await?;
        tx.commit().await.context("Failed to commit schedule fire")?;
        Ok(true)
    }

    async fn insert_job(&self, job: &CrawlJob) -> Result<()> {
        insert_job_with(&self.pool, job).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<CrawlJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get crawl job")?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<CrawlJob>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM crawl_jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::UUID IS NULL OR website_id = $2)
              AND ($3::TEXT IS NULL OR kind = $3)
            ORDER BY created_at ASC
            LIMIT $4
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.website_id.map(|w| w.0))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.limit.unwrap_or(1000))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list crawl jobs")?;

        rows.iter().map(job_from_row).collect()
    }

    async fn claim_jobs(
        &self,
        worker_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<CrawlJob>> {
        let rows = sqlx::query(&format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM crawl_jobs
                WHERE status = 'pending'
                  AND (scheduled_at IS NULL OR scheduled_at <= $3)
                ORDER BY priority DESC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE crawl_jobs
            SET status = 'running',
                started_at = $3,
                worker_id = $2,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(limit)
        .bind(worker_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim crawl jobs")?;

        rows.iter().map(job_from_row).collect()
    }

    async fn update_progress(&self, id: JobId, progress: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET progress = GREATEST(progress, $1), updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(progress)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .context("Failed to update progress")?;
        Ok(())
    }

    async fn complete_job(&self, id: JobId, at: DateTime<Utc>) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'completed', completed_at = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(at)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .context("Failed to complete crawl job")?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn requeue_for_retry(
        &self,
        id: JobId,
        retry_count: i32,
        scheduled_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'pending',
                retry_count = $1,
                scheduled_at = $2,
                error_message = $3,
                worker_id = NULL,
                started_at = NULL,
                updated_at = NOW()
            WHERE id = $4 AND status = 'running'
            "#,
        )
        .bind(retry_count)
        .bind(scheduled_at)
        .bind(error_message)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .context("Failed to requeue crawl job")?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn fail_job_terminally(&self, id: JobId, error_message: &str) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'failed', error_message = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(error_message)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .context("Failed to terminally fail crawl job")?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn cancel_job(&self, id: JobId, actor: &str, reason: &str) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'cancelled',
                cancelled_at = NOW(),
                cancelled_by = $1,
                cancellation_reason = $2,
                updated_at = NOW()
            WHERE id = $3 AND status IN ('pending', 'running')
            "#,
        )
        .bind(actor)
        .bind(reason)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .context("Failed to cancel crawl job")?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn stale_running_jobs(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CrawlJob>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM crawl_jobs
            WHERE status = 'running' AND started_at < $1
            ORDER BY started_at ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list stale running jobs")?;

        rows.iter().map(job_from_row).collect()
    }

    async fn purge_terminal_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let affected = sqlx::query(
            r#"
            DELETE FROM crawl_jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .context("Failed to purge terminal jobs")?
        .rows_affected();
        Ok(affected)
    }

    async fn append_retry_history(&self, entry: &RetryHistory) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_history (
                id, job_id, attempt, category, message, stack_trace,
                delay_secs, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id.0)
        .bind(entry.job_id.0)
        .bind(entry.attempt)
        .bind(entry.category.as_str())
        .bind(&entry.message)
        .bind(&entry.stack_trace)
        .bind(entry.delay_secs)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await
        .context("Failed to append retry history")?;
        Ok(())
    }

    async fn list_retry_history(&self, job_id: JobId) -> Result<Vec<RetryHistory>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, attempt, category, message, stack_trace,
                   delay_secs, recorded_at
            FROM retry_history
            WHERE job_id = $1
            ORDER BY attempt ASC
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list retry history")?;

        rows.iter().map(retry_history_from_row).collect()
    }

    async fn upsert_policy(&self, policy: &RetryPolicy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_policies (
                category, retryable, max_attempts, backoff,
                initial_delay_secs, max_delay_secs, backoff_multiplier, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (category) DO UPDATE SET
                retryable = EXCLUDED.retryable,
                max_attempts = EXCLUDED.max_attempts,
                backoff = EXCLUDED.backoff,
                initial_delay_secs = EXCLUDED.initial_delay_secs,
                max_delay_secs = EXCLUDED.max_delay_secs,
                backoff_multiplier = EXCLUDED.backoff_multiplier,
                updated_at = NOW()
            "#,
        )
        .bind(policy.category.as_str())
        .bind(policy.retryable)
        .bind(policy.max_attempts)
        .bind(policy.backoff.as_str())
        .bind(policy.initial_delay_secs)
        .bind(policy.max_delay_secs)
        .bind(policy.backoff_multiplier)
        .bind(policy.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert retry policy")?;
        Ok(())
    }

    async fn get_policy(&self, category: ErrorCategory) -> Result<Option<RetryPolicy>> {
        let row = sqlx::query(
            r#"
            SELECT category, retryable, max_attempts, backoff,
                   initial_delay_secs, max_delay_secs, backoff_multiplier, updated_at
            FROM retry_policies
            WHERE category = $1
            "#,
        )
        .bind(category.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get retry policy")?;

        row.as_ref().map(policy_from_row).transpose()
    }

    async fn list_policies(&self) -> Result<Vec<RetryPolicy>> {
        let rows = sqlx::query(
            r#"
            SELECT category, retryable, max_attempts, backoff,
                   initial_delay_secs, max_delay_secs, backoff_multiplier, updated_at
            FROM retry_policies
            ORDER BY category
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list retry policies")?;

        rows.iter().map(policy_from_row).collect()
    }

    async fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            INSERT INTO dead_letter_entries (
                id, job_id, website_id, category, message, stack_trace,
                http_status, attempt_count, first_attempt_at, last_attempt_at,
                resolution, resolution_notes, manual_retry_outcome, resolved_at,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(entry.id.0)
        .bind(entry.job_id.0)
        .bind(entry.website_id.map(|w| w.0))
        .bind(entry.category.as_str())
        .bind(&entry.message)
        .bind(&entry.stack_trace)
        .bind(entry.http_status)
        .bind(entry.attempt_count)
        .bind(entry.first_attempt_at)
        .bind(entry.last_attempt_at)
        .bind(entry.resolution.as_str())
        .bind(&entry.resolution_notes)
        .bind(&entry.manual_retry_outcome)
        .bind(entry.resolved_at)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert dead letter entry")?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, website_id, category, message, stack_trace,
                   http_status, attempt_count, first_attempt_at, last_attempt_at,
                   resolution, resolution_notes, manual_retry_outcome, resolved_at,
                   created_at
            FROM dead_letter_entries
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get dead letter entry")?;

        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn get_dead_letter_for_job(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, website_id, category, message, stack_trace,
                   http_status, attempt_count, first_attempt_at, last_attempt_at,
                   resolution, resolution_notes, manual_retry_outcome, resolved_at,
                   created_at
            FROM dead_letter_entries
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get dead letter entry for job")?;

        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, website_id, category, message, stack_trace,
                   http_status, attempt_count, first_attempt_at, last_attempt_at,
                   resolution, resolution_notes, manual_retry_outcome, resolved_at,
                   created_at
            FROM dead_letter_entries
            WHERE ($1::TEXT IS NULL OR category = $1)
              AND ($2::UUID IS NULL OR website_id = $2)
              AND ($3::TEXT IS NULL OR resolution = $3)
            ORDER BY created_at ASC
            LIMIT $4
            "#,
        )
        .bind(filter.category.map(|c| c.as_str()))
        .bind(filter.website_id.map(|w| w.0))
        .bind(filter.resolution.map(|r| r.as_str()))
        .bind(filter.limit.unwrap_or(1000))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list dead letter entries")?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn mark_manual_retry(&self, id: DeadLetterId, outcome: &str) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE dead_letter_entries
            SET resolution = 'manually_retried', manual_retry_outcome = $1
            WHERE id = $2 AND resolution <> 'resolved'
            "#,
        )
        .bind(outcome)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .context("Failed to mark manual retry")?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn resolve_dead_letter(
        &self,
        id: DeadLetterId,
        notes: Option<&str>,
        overwrite_notes: bool,
    ) -> Result<bool> {
        if overwrite_notes {
            sqlx::query(
                r#"
                UPDATE dead_letter_entries
                SET resolution_notes = $1
                WHERE id = $2 AND resolution = 'resolved'
                "#,
            )
            .bind(notes)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .context("Failed to overwrite resolution notes")?;
        }

        let affected = sqlx::query(
            r#"
            UPDATE dead_letter_entries
            SET resolution = 'resolved', resolution_notes = $1, resolved_at = NOW()
            WHERE id = $2 AND resolution <> 'resolved'
            "#,
        )
        .bind(notes)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .context("Failed to resolve dead letter entry")?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn bulk_resolve(&self, ids: &[DeadLetterId], notes: Option<&str>) -> Result<u64> {
        let raw: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let affected = sqlx::query(
            r#"
            UPDATE dead_letter_entries
            SET resolution = 'resolved', resolution_notes = $1, resolved_at = NOW()
            WHERE id = ANY($2) AND resolution <> 'resolved'
            "#,
        )
        .bind(notes)
        .bind(&raw)
        .execute(&self.pool)
        .await
        .context("Failed to bulk resolve dead letter entries")?
        .rows_affected();
        Ok(affected)
    }

    async fn oldest_unresolved(&self) -> Result<Option<DeadLetterEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, website_id, category, message, stack_trace,
                   http_status, attempt_count, first_attempt_at, last_attempt_at,
                   resolution, resolution_notes, manual_retry_outcome, resolved_at,
                   created_at
            FROM dead_letter_entries
            WHERE resolution = 'unresolved'
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query oldest unresolved entry")?;

        row.as_ref().map(dead_letter_from_row).transpose()
    }
}
