//! End-to-end lifecycle properties over the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use orchestrator::store::JobFilter;
use orchestrator::{
    ErrorCategory, FailureDisposition, FetchFailure, JobEngine, JobSpec, JobStatus, MemoryStore,
    RecurringScheduler, ScheduledJob, Store, SubmitRequest, Website,
};

fn inline_request(url: &str) -> SubmitRequest {
    SubmitRequest::new(
        JobSpec::Inline {
            config: serde_json::json!({"max_depth": 2}),
        },
        url,
    )
}

#[tokio::test]
async fn concurrent_claimers_never_share_a_job() {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(JobEngine::new(store.clone()));

    for i in 0..20 {
        engine
            .submit(inline_request(&format!("https://example.com/page/{i}")))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let claimed = engine.claim(&format!("worker-{w}"), 3).await.unwrap();
                if claimed.is_empty() {
                    break mine;
                }
                mine.extend(claimed.into_iter().map(|j| j.id));
            }
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {id} claimed by two workers");
        }
    }
    assert_eq!(total, 20);
}

#[tokio::test]
async fn retry_chain_has_increasing_attempts_and_consistent_backoff() {
    let store = Arc::new(MemoryStore::new());
    let engine = JobEngine::new(store.clone());
    let job = engine.submit(inline_request("https://example.com/")).await.unwrap();

    // Default transient-network policy: exponential, 30s initial, x2.
    let mut expected_delay = 30;
    for attempt in 1..=3 {
        // Make the job due, then claim and fail it.
        let mut stored = store.get_job(job.id).await.unwrap().unwrap();
        stored.scheduled_at = None;
        store.insert_job(&stored).await.unwrap();
        let claimed = engine.claim("worker-1", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);

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
                attempt: a,
                delay,
                next_run_at,
            } => {
                assert_eq!(a, attempt);
                assert_eq!(delay, Duration::seconds(expected_delay));
                assert!(next_run_at >= before + delay);
            }
            other => panic!("attempt {attempt}: expected retry, got {other:?}"),
        }
        expected_delay *= 2;

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, attempt);
    }

    let history = store.list_retry_history(job.id).await.unwrap();
    let attempts: Vec<i32> = history.iter().map(|h| h.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    let delays: Vec<Option<i64>> = history.iter().map(|h| h.delay_secs).collect();
    assert_eq!(delays, vec![Some(30), Some(60), Some(120)]);
}

#[tokio::test]
async fn exhausted_job_is_dead_lettered_exactly_once_and_stays_failed() {
    let store = Arc::new(MemoryStore::new());
    let engine = JobEngine::new(store.clone());
    let job = engine
        .submit({
            let mut r = inline_request("https://example.com/");
            r.max_retries = Some(1);
            r
        })
        .await
        .unwrap();

    // First failure retries, second exhausts.
    engine.claim("worker-1", 1).await.unwrap();
    engine
        .fail(job.id, FetchFailure::new(ErrorCategory::Unknown, "boom"))
        .await
        .unwrap();

    let mut stored = store.get_job(job.id).await.unwrap().unwrap();
    stored.scheduled_at = None;
    store.insert_job(&stored).await.unwrap();
    engine.claim("worker-1", 1).await.unwrap();
    let disposition = engine
        .fail(job.id, FetchFailure::new(ErrorCategory::Unknown, "boom again"))
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
    assert!(engine.claim("worker-2", 10).await.unwrap().is_empty());

    let entries = store
        .list_dead_letters(&Default::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job_id, job.id);
    assert_eq!(entries[0].attempt_count, 2);
}

#[tokio::test]
async fn scheduler_and_engine_compose_into_a_full_cycle() {
    let store = Arc::new(MemoryStore::new());
    let engine = JobEngine::new(store.clone());
    let scheduler = RecurringScheduler::new(store.clone());

    let website = Website::new("example", "https://example.com", serde_json::json!({}));
    store.insert_website(&website).await.unwrap();
    let mut schedule = ScheduledJob::new(website.id, "0 0 * * * *", Utc::now()).unwrap();
    schedule.next_run_at = Utc::now() - Duration::seconds(1);
    store.insert_schedule(&schedule).await.unwrap();

    let outcome = scheduler.run_once(Utc::now()).await.unwrap();
    assert_eq!(outcome.fired, 1);

    let claimed = engine.claim("worker-1", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].seed_url, "https://example.com");
    engine.complete(claimed[0].id).await.unwrap();

    let jobs = store
        .list_jobs(&JobFilter {
            status: Some(JobStatus::Completed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
}
