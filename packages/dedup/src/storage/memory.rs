//! In-memory store for unit and property tests.
//!
//! One mutex over the whole state gives the same all-or-nothing semantics
//! the Postgres transactions provide.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator::WebsiteId;
use uuid::Uuid;

use super::{DedupStore, NearCandidate};
use crate::simhash::SimHash;
use crate::types::{
    ContentDigest, CrawledPage, DetectionMethod, DuplicateGroup, DuplicateRelationship,
    FingerprintEntry, GroupId, PageId, RelationshipId,
};

#[derive(Default)]
struct Inner {
    fingerprints: HashMap<String, FingerprintEntry>,
    pages: HashMap<PageId, CrawledPage>,
    /// (website_id, url_hash) → page id
    page_index: HashMap<(Uuid, String), PageId>,
    groups: HashMap<GroupId, DuplicateGroup>,
    canonical_index: HashMap<PageId, GroupId>,
    member_index: HashMap<PageId, GroupId>,
    relationships: Vec<DuplicateRelationship>,
}

#[derive(Default)]
pub struct MemoryDedupStore {
    inner: Mutex<Inner>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Test helper: total stored pages.
    pub fn page_count(&self) -> usize {
        self.lock().pages.len()
    }
}

fn detach_from_group(inner: &mut Inner, page: PageId) {
    if let Some(group_id) = inner.member_index.remove(&page) {
        inner.relationships.retain(|r| r.page_id != page);
        if let Some(group) = inner.groups.get_mut(&group_id) {
            group.group_size -= 1;
            group.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn upsert_fingerprint(
        &self,
        digest: &ContentDigest,
        first_page: PageId,
        simhash: SimHash,
        now: DateTime<Utc>,
    ) -> Result<FingerprintEntry> {
        let mut inner = self.lock();
        let entry = inner
            .fingerprints
            .entry(digest.0.clone())
            .and_modify(|e| {
                e.occurrence_count += 1;
                e.simhash = simhash.0;
                e.last_seen_at = now;
            })
            .or_insert_with(|| FingerprintEntry {
                digest: digest.clone(),
                first_page_id: first_page,
                occurrence_count: 1,
                simhash: simhash.0,
                first_seen_at: now,
                last_seen_at: now,
            });
        Ok(entry.clone())
    }

    async fn nearest_fingerprints(
        &self,
        simhash: SimHash,
        exclude_digest: &ContentDigest,
        max_distance: u32,
        limit: i64,
    ) -> Result<Vec<NearCandidate>> {
        let inner = self.lock();
        let mut candidates: Vec<NearCandidate> = inner
            .fingerprints
            .values()
            .filter(|e| e.digest != *exclude_digest)
            .filter_map(|e| {
                let distance = simhash.hamming_distance(&SimHash(e.simhash));
                (distance <= max_distance).then(|| NearCandidate {
                    digest: e.digest.clone(),
                    first_page_id: e.first_page_id,
                    distance,
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then_with(|| a.digest.0.cmp(&b.digest.0))
        });
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates)
    }

    async fn upsert_page(&self, page: &CrawledPage) -> Result<CrawledPage> {
        let mut inner = self.lock();
        let key = (page.website_id.0, page.url_hash.clone());

        if let Some(&existing_id) = inner.page_index.get(&key) {
            let content_changed = {
                let existing = inner
                    .pages
                    .get(&existing_id)
                    .ok_or_else(|| anyhow!("page index points at missing page"))?;
                existing.content_hash != page.content_hash
            };
            if content_changed {
                // The new content gets a fresh duplicate evaluation.
                detach_from_group(&mut inner, existing_id);
            }
            let existing = inner
                .pages
                .get_mut(&existing_id)
                .ok_or_else(|| anyhow!("page index points at missing page"))?;
            existing.content = page.content.clone();
            existing.title = page.title.clone();
            existing.content_hash = page.content_hash.clone();
            existing.job_id = page.job_id;
            existing.fetched_at = page.fetched_at;
            existing.updated_at = Utc::now();
            if content_changed {
                existing.is_duplicate = false;
                existing.duplicate_of = None;
                existing.similarity_score = None;
            }
            return Ok(existing.clone());
        }

        inner.page_index.insert(key, page.id);
        inner.pages.insert(page.id, page.clone());
        Ok(page.clone())
    }

    async fn get_page(&self, id: PageId) -> Result<Option<CrawledPage>> {
        Ok(self.lock().pages.get(&id).cloned())
    }

    async fn mark_duplicate(&self, page: PageId, of: PageId, score: f64) -> Result<()> {
        let mut inner = self.lock();
        let row = inner
            .pages
            .get_mut(&page)
            .ok_or_else(|| anyhow!("page {page} does not exist"))?;
        row.is_duplicate = true;
        row.duplicate_of = Some(of);
        row.similarity_score = Some(score);
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn attach_to_group(
        &self,
        website_id: WebsiteId,
        canonical_page: PageId,
        duplicate_page: PageId,
        method: DetectionMethod,
        score: f64,
    ) -> Result<GroupId> {
        let mut inner = self.lock();

        let group_id = match inner.canonical_index.get(&canonical_page) {
            Some(&id) => id,
            None => {
                let now = Utc::now();
                let group = DuplicateGroup {
                    id: GroupId::new(),
                    website_id,
                    canonical_page_id: canonical_page,
                    group_size: 1,
                    created_at: now,
                    updated_at: now,
                };
                let id = group.id;
                inner.groups.insert(id, group);
                inner.canonical_index.insert(canonical_page, id);
                id
            }
        };

        // A page belongs to at most one group; a second attach is a no-op.
        if let Some(&existing) = inner.member_index.get(&duplicate_page) {
            return Ok(existing);
        }

        inner.relationships.push(DuplicateRelationship {
            id: RelationshipId::new(),
            group_id,
            page_id: duplicate_page,
            method,
            similarity_score: score,
            created_at: Utc::now(),
        });
        inner.member_index.insert(duplicate_page, group_id);
        let group = inner
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| anyhow!("group {group_id} vanished during attach"))?;
        group.group_size += 1;
        group.updated_at = Utc::now();
        Ok(group_id)
    }

    async fn group_for_page(&self, page: PageId) -> Result<Option<DuplicateGroup>> {
        let inner = self.lock();
        let group_id = inner
            .canonical_index
            .get(&page)
            .or_else(|| inner.member_index.get(&page));
        Ok(group_id.and_then(|id| inner.groups.get(id)).cloned())
    }

    async fn relationships_for_group(
        &self,
        group: GroupId,
    ) -> Result<Vec<DuplicateRelationship>> {
        Ok(self
            .lock()
            .relationships
            .iter()
            .filter(|r| r.group_id == group)
            .cloned()
            .collect())
    }

    async fn orphan_duplicates(&self, limit: i64) -> Result<Vec<CrawledPage>> {
        let inner = self.lock();
        let mut orphans: Vec<CrawledPage> = inner
            .pages
            .values()
            .filter(|p| {
                p.is_duplicate
                    && p.duplicate_of.is_some()
                    && !inner.member_index.contains_key(&p.id)
            })
            .cloned()
            .collect();
        orphans.sort_by_key(|p| p.created_at);
        orphans.truncate(limit.max(0) as usize);
        Ok(orphans)
    }
}
