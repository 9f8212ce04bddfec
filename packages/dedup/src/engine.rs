//! Two-tier duplicate detection: exact digest, then SimHash neighborhood.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::DedupConfig;
use crate::simhash::SimHash;
use crate::storage::DedupStore;
use crate::types::{CrawledPage, DetectionMethod, FetchedPage, PageId};

/// Verdict for one processed page.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    Unique,
    /// Same normalized content as an earlier page; score is 1.0.
    ExactDuplicate { of: PageId },
    /// Fingerprint within the Hamming threshold of an earlier page.
    NearDuplicate { of: PageId, distance: u32, score: f64 },
}

/// The stored page together with the verdict reached for it.
#[derive(Debug, Clone)]
pub struct DedupReport {
    pub page: CrawledPage,
    pub outcome: DedupOutcome,
}

pub struct DedupEngine {
    store: Arc<dyn DedupStore>,
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self::with_config(store, DedupConfig::default())
    }

    pub fn with_config(store: Arc<dyn DedupStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn DedupStore> {
        &self.store
    }

    /// Run detection for one successfully fetched page.
    ///
    /// Tier 1 upserts the exact-digest registry entry; a pre-existing
    /// entry whose first-seen page is someone else means exact duplicate.
    /// Tier 2 searches the registry for fingerprints within the Hamming
    /// threshold. Either match flags the page and attaches it to the
    /// matched page's group.
    pub async fn process_page(&self, input: FetchedPage) -> Result<DedupReport> {
        let candidate = CrawledPage::from_fetched(&input);
        let simhash = SimHash::compute(&input.content);
        let page = self
            .store
            .upsert_page(&candidate)
            .await
            .context("failed to upsert crawled page")?;

        let entry = self
            .store
            .upsert_fingerprint(&page.content_hash, page.id, simhash, Utc::now())
            .await
            .context("failed to upsert fingerprint")?;

        // Re-crawling the same URL with identical content revisits its own
        // registry entry; that is not a duplicate of anything.
        if entry.occurrence_count > 1 && entry.first_page_id != page.id {
            let of = entry.first_page_id;
            self.link(&page, of, DetectionMethod::ExactHash, 1.0).await?;
            info!(page_id = %page.id, duplicate_of = %of, "exact duplicate detected");
            let page = self.reload(page.id).await?;
            return Ok(DedupReport {
                page,
                outcome: DedupOutcome::ExactDuplicate { of },
            });
        }

        let candidates = self
            .store
            .nearest_fingerprints(
                simhash,
                &page.content_hash,
                self.config.hamming_threshold,
                self.config.max_candidates,
            )
            .await
            .context("failed to query near-duplicate candidates")?;

        if let Some(near) = candidates.iter().find(|c| c.first_page_id != page.id) {
            let of = near.first_page_id;
            let score = 1.0 - near.distance as f64 / 64.0;
            self.link(&page, of, DetectionMethod::SimhashFingerprint, score)
                .await?;
            info!(
                page_id = %page.id,
                duplicate_of = %of,
                distance = near.distance,
                score,
                "near duplicate detected"
            );
            let page = self.reload(page.id).await?;
            return Ok(DedupReport {
                page,
                outcome: DedupOutcome::NearDuplicate {
                    of,
                    distance: near.distance,
                    score,
                },
            });
        }

        debug!(page_id = %page.id, "page is unique");
        Ok(DedupReport {
            page,
            outcome: DedupOutcome::Unique,
        })
    }

    /// Re-attach pages flagged duplicate that lost their group membership.
    /// Group membership is the source of truth for the flag; this pass
    /// closes the gap for rows where the two drifted apart.
    pub async fn repair_orphans(&self, limit: i64) -> Result<usize> {
        let orphans = self.store.orphan_duplicates(limit).await?;
        let mut repaired = 0;
        for orphan in orphans {
            let Some(of) = orphan.duplicate_of else {
                continue;
            };
            let score = orphan.similarity_score.unwrap_or(1.0);
            let method = if score >= 1.0 {
                DetectionMethod::ExactHash
            } else {
                DetectionMethod::SimhashFingerprint
            };
            warn!(page_id = %orphan.id, duplicate_of = %of, "re-attaching orphan duplicate");
            self.link(&orphan, of, method, score)
                .await
                .with_context(|| format!("failed to repair orphan page {}", orphan.id))?;
            repaired += 1;
        }
        Ok(repaired)
    }

    /// Flag the page and attach it to the matched page's group. When the
    /// matched page is itself a member of a group, the new page joins that
    /// group instead of seeding a second one around a non-canonical page.
    async fn link(
        &self,
        page: &CrawledPage,
        matched: PageId,
        method: DetectionMethod,
        score: f64,
    ) -> Result<()> {
        self.store.mark_duplicate(page.id, matched, score).await?;

        let canonical = match self.store.group_for_page(matched).await? {
            Some(group) => group.canonical_page_id,
            None => matched,
        };
        self.store
            .attach_to_group(page.website_id, canonical, page.id, method, score)
            .await?;
        Ok(())
    }

    async fn reload(&self, id: PageId) -> Result<CrawledPage> {
        self.store
            .get_page(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("page {id} vanished after linking"))
    }
}
