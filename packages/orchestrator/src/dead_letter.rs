//! Operator surface over the dead letter backlog.
//!
//! Entries are created by the lifecycle engine when a job is abandoned;
//! this service covers everything that happens to them afterwards:
//! inspection, manual retry bookkeeping, and resolution.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::engine::{JobEngine, SubmitRequest};
use crate::models::{CrawlJob, DeadLetterEntry};
use crate::store::{DeadLetterFilter, Store};
use crate::types::{DeadLetterId, JobSpec};

pub struct DeadLetterPipeline {
    store: Arc<dyn Store>,
}

impl DeadLetterPipeline {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
        self.store.get_dead_letter(id).await
    }

    pub async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        self.store.list_dead_letters(filter).await
    }

    /// Re-run a dead-lettered job as a fresh submission. The original job
    /// stays failed; the entry records the attempt and the new job id as
    /// its outcome. Rejected for resolved entries.
    pub async fn retry(&self, id: DeadLetterId, engine: &JobEngine) -> Result<CrawlJob> {
        let entry = self
            .store
            .get_dead_letter(id)
            .await?
            .ok_or_else(|| anyhow!("dead letter entry {id} does not exist"))?;
        if entry.is_resolved() {
            return Err(anyhow!("dead letter entry {id} is already resolved"));
        }

        let original = self
            .store
            .get_job(entry.job_id)
            .await?
            .ok_or_else(|| anyhow!("original job {} no longer exists", entry.job_id))?;

        let mut request = SubmitRequest::new(original.spec.clone(), original.seed_url.clone())
            .with_priority(original.priority);
        request.max_retries = Some(original.max_retries);
        let job = engine.submit(request).await?;

        let outcome = format!("resubmitted as job {}", job.id);
        if !self.store.mark_manual_retry(id, &outcome).await? {
            // Raced with a resolve; the new job still runs.
            warn!(dead_letter_id = %id, "entry resolved while recording manual retry");
        }
        info!(dead_letter_id = %id, new_job_id = %job.id, "dead letter entry manually retried");
        Ok(job)
    }

    /// Mark an entry resolved. Resolving twice is a no-op that preserves
    /// the original notes unless `overwrite_notes` is set.
    pub async fn resolve(
        &self,
        id: DeadLetterId,
        notes: Option<&str>,
        overwrite_notes: bool,
    ) -> Result<bool> {
        let changed = self.store.resolve_dead_letter(id, notes, overwrite_notes).await?;
        if changed {
            info!(dead_letter_id = %id, "dead letter entry resolved");
        }
        Ok(changed)
    }

    /// Resolve a batch in one call; returns how many entries changed.
    pub async fn bulk_resolve(&self, ids: &[DeadLetterId], notes: Option<&str>) -> Result<u64> {
        let changed = self.store.bulk_resolve(ids, notes).await?;
        info!(requested = ids.len(), changed, "bulk dead letter resolution");
        Ok(changed)
    }

    /// Age of the oldest unresolved entry, for backlog alerting.
    pub async fn oldest_unresolved_age(&self) -> Result<Option<Duration>> {
        Ok(self
            .store
            .oldest_unresolved()
            .await?
            .map(|entry| Utc::now() - entry.created_at))
    }
}

// Convenience for resubmission of templated entries that lost their job row.
impl DeadLetterPipeline {
    /// Fallback resubmission when the original job was purged: rebuilds a
    /// templated spec from the entry's website. Inline jobs cannot be
    /// rebuilt this way.
    pub async fn retry_from_entry(
        &self,
        entry: &DeadLetterEntry,
        seed_url: &str,
        engine: &JobEngine,
    ) -> Result<CrawlJob> {
        let website_id = entry
            .website_id
            .ok_or_else(|| anyhow!("entry {} has no website, cannot rebuild spec", entry.id))?;
        let job = engine
            .submit(SubmitRequest::new(JobSpec::Templated { website_id }, seed_url))
            .await?;
        let outcome = format!("resubmitted as job {}", job.id);
        self.store.mark_manual_retry(entry.id, &outcome).await?;
        Ok(job)
    }
}
