//! Persistence boundary for fingerprints, pages, and duplicate groups.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator::WebsiteId;

use crate::simhash::SimHash;
use crate::types::{
    ContentDigest, CrawledPage, DetectionMethod, DuplicateGroup, DuplicateRelationship, GroupId,
    PageId,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryDedupStore;
pub use postgres::PostgresDedupStore;

/// A registry candidate returned by the nearest-fingerprint query.
#[derive(Debug, Clone)]
pub struct NearCandidate {
    pub digest: ContentDigest,
    pub first_page_id: PageId,
    pub distance: u32,
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Upsert the fingerprint registry row for `digest` and return its
    /// post-upsert state. First sighting inserts with occurrence count 1
    /// and `first_page` as the first-seen page; later sightings increment
    /// the count and refresh fingerprint and last-seen timestamp, never
    /// touching the first-seen reference.
    async fn upsert_fingerprint(
        &self,
        digest: &ContentDigest,
        first_page: PageId,
        simhash: SimHash,
        now: DateTime<Utc>,
    ) -> Result<crate::types::FingerprintEntry>;

    /// Registry entries whose fingerprint is within `max_distance` of
    /// `simhash`, excluding `exclude_digest`, ordered by distance
    /// ascending, capped at `limit`.
    async fn nearest_fingerprints(
        &self,
        simhash: SimHash,
        exclude_digest: &ContentDigest,
        max_distance: u32,
        limit: i64,
    ) -> Result<Vec<NearCandidate>>;

    /// Upsert keyed (website_id, url_hash): a re-crawl of the same URL
    /// replaces content, title, content hash, and fetch timestamp in place
    /// and clears any previous duplicate verdict (the new content gets a
    /// fresh evaluation). Returns the stored row, keeping the original
    /// page id when the row already existed.
    async fn upsert_page(&self, page: &CrawledPage) -> Result<CrawledPage>;

    async fn get_page(&self, id: PageId) -> Result<Option<CrawledPage>>;

    /// Flag `page` as a duplicate of `of` with the given score.
    async fn mark_duplicate(&self, page: PageId, of: PageId, score: f64) -> Result<()>;

    /// Attach a duplicate page to the canonical page's group in one
    /// transaction: find-or-create the group keyed by canonical page id,
    /// insert the membership (unique per duplicate page), bump
    /// `group_size`. Racing attachers converge on the same group.
    async fn attach_to_group(
        &self,
        website_id: WebsiteId,
        canonical_page: PageId,
        duplicate_page: PageId,
        method: DetectionMethod,
        score: f64,
    ) -> Result<GroupId>;

    /// The group a page belongs to, whether as canonical or as member.
    async fn group_for_page(&self, page: PageId) -> Result<Option<DuplicateGroup>>;

    async fn relationships_for_group(&self, group: GroupId)
        -> Result<Vec<DuplicateRelationship>>;

    /// Pages flagged duplicate (with a `duplicate_of` pointer) that have
    /// no group membership; input to the repair pass.
    async fn orphan_duplicates(&self, limit: i64) -> Result<Vec<CrawledPage>>;
}
