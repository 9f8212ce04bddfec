//! PostgreSQL store integration tests.
//!
//! Requires Docker; run with `cargo test -- --ignored`.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use orchestrator::{
    ErrorCategory, FailureDisposition, FetchFailure, JobEngine, JobSpec, JobStatus, PostgresStore,
    RecurringScheduler, ScheduledJob, Store, SubmitRequest, Website,
};

struct SharedInfra {
    db_url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedInfra> = OnceCell::const_new();

impl SharedInfra {
    async fn init() -> Result<Self> {
        dotenvy::dotenv().ok();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

async fn store() -> Arc<PostgresStore> {
    let infra = SharedInfra::get().await;
    let pool = PgPool::connect(&infra.db_url)
        .await
        .expect("Failed to connect to Postgres");
    let store = PostgresStore::new(pool);
    store.init_schema().await.expect("Failed to create schema");
    Arc::new(store)
}

#[tokio::test]
#[ignore]
async fn claim_transitions_exactly_one_worker_per_job() {
    let store = store().await;
    let engine = Arc::new(JobEngine::new(store.clone()));

    let mut submitted = Vec::new();
    for i in 0..10 {
        let job = engine
            .submit(SubmitRequest::new(
                JobSpec::Inline {
                    config: serde_json::json!({}),
                },
                format!("https://claim-test.example/{i}"),
            ))
            .await
            .unwrap();
        submitted.push(job.id);
    }

    let (a, b) = tokio::join!(engine.claim("pg-worker-a", 10), engine.claim("pg-worker-b", 10));
    let (a, b) = (a.unwrap(), b.unwrap());

    let ours: Vec<_> = a
        .iter()
        .chain(b.iter())
        .filter(|j| submitted.contains(&j.id))
        .collect();
    assert_eq!(ours.len(), 10);
    for job in &ours {
        assert_eq!(job.status, JobStatus::Running);
        let other: Vec<_> = ours.iter().filter(|j| j.id == job.id).collect();
        assert_eq!(other.len(), 1, "job {} claimed twice", job.id);
    }
}

#[tokio::test]
#[ignore]
async fn schedule_fire_is_atomic_under_concurrent_passes() {
    let store = store().await;
    let website = Website::new("pg-sched", "https://sched.example", serde_json::json!({}));
    store.insert_website(&website).await.unwrap();

    let mut schedule = ScheduledJob::new(website.id, "0 0 * * * *", Utc::now()).unwrap();
    schedule.next_run_at = Utc::now() - Duration::seconds(1);
    store.insert_schedule(&schedule).await.unwrap();

    let a = RecurringScheduler::new(store.clone());
    let b = RecurringScheduler::new(store.clone());
    let now = Utc::now();
    let (ra, rb) = tokio::join!(a.run_once(now), b.run_once(now));
    let fired = ra.unwrap().fired + rb.unwrap().fired;
    assert_eq!(fired, 1);

    let advanced = store.get_schedule(schedule.id).await.unwrap().unwrap();
    assert!(advanced.next_run_at > now);
    assert_eq!(advanced.last_run_at, Some(now));
}

#[tokio::test]
#[ignore]
async fn failure_escalation_round_trips_through_postgres() {
    let store = store().await;
    let engine = JobEngine::new(store.clone());

    let job = engine
        .submit(SubmitRequest::new(
            JobSpec::Inline {
                config: serde_json::json!({"depth": 1}),
            },
            "https://escalation.example/",
        ))
        .await
        .unwrap();

    // Another test's worker may win the claim on the shared database;
    // either way the job must end up running before the failure report.
    engine.claim("pg-worker-esc", 50).await.unwrap();
    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Running);

    let disposition = engine
        .fail(
            job.id,
            FetchFailure::new(ErrorCategory::ContentMalformed, "not html")
                .with_http_status(200),
        )
        .await
        .unwrap();
    assert_eq!(
        disposition,
        FailureDisposition::DeadLettered {
            newly_escalated: true
        }
    );

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);

    let entry = store.get_dead_letter_for_job(job.id).await.unwrap().unwrap();
    assert_eq!(entry.category, ErrorCategory::ContentMalformed);
    assert_eq!(entry.http_status, Some(200));

    let history = store.list_retry_history(job.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].delay_secs, None);
}
