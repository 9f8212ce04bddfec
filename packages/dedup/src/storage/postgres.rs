//! PostgreSQL store implementation.
//!
//! The Hamming-distance search runs in SQL via
//! `bit_count((simhash # $1)::bit(64))`; fingerprints are stored as
//! BIGINT with the u64 bit pattern reinterpreted.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator::{JobId, WebsiteId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{DedupStore, NearCandidate};
use crate::simhash::SimHash;
use crate::types::{
    ContentDigest, CrawledPage, DetectionMethod, DuplicateGroup, DuplicateRelationship,
    FingerprintEntry, GroupId, PageId, RelationshipId,
};

pub struct PostgresDedupStore {
    pool: PgPool,
}

const PAGE_COLUMNS: &str = "id, website_id, job_id, url, url_hash, content_hash, content, title, \
     is_duplicate, duplicate_of, similarity_score, fetched_at, created_at, updated_at";

impl PostgresDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the dedup tables if they do not exist.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS content_fingerprints (
                digest TEXT PRIMARY KEY,
                first_page_id UUID NOT NULL,
                occurrence_count BIGINT NOT NULL DEFAULT 1,
                simhash BIGINT NOT NULL,
                first_seen_at TIMESTAMPTZ NOT NULL,
                last_seen_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create content_fingerprints table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS crawled_pages (
                id UUID PRIMARY KEY,
                website_id UUID NOT NULL,
                job_id UUID,
                url TEXT NOT NULL,
                url_hash TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                content TEXT NOT NULL,
                title TEXT,
                is_duplicate BOOLEAN NOT NULL DEFAULT FALSE,
                duplicate_of UUID,
                similarity_score DOUBLE PRECISION,
                fetched_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (website_id, url_hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create crawled_pages table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_crawled_pages_content_hash \
             ON crawled_pages(content_hash)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create crawled_pages index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS duplicate_groups (
                id UUID PRIMARY KEY,
                website_id UUID NOT NULL,
                canonical_page_id UUID NOT NULL UNIQUE,
                group_size INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create duplicate_groups table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS duplicate_relationships (
                id UUID PRIMARY KEY,
                group_id UUID NOT NULL REFERENCES duplicate_groups(id) ON DELETE CASCADE,
                page_id UUID NOT NULL UNIQUE,
                method TEXT NOT NULL,
                similarity_score DOUBLE PRECISION NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create duplicate_relationships table")?;

        Ok(())
    }
}

fn fingerprint_from_row(r: &PgRow) -> Result<FingerprintEntry> {
    Ok(FingerprintEntry {
        digest: ContentDigest(r.get("digest")),
        first_page_id: PageId(r.get("first_page_id")),
        occurrence_count: r.get("occurrence_count"),
        simhash: r.get::<i64, _>("simhash") as u64,
        first_seen_at: r.get("first_seen_at"),
        last_seen_at: r.get("last_seen_at"),
    })
}

fn page_from_row(r: &PgRow) -> Result<CrawledPage> {
    Ok(CrawledPage {
        id: PageId(r.get("id")),
        website_id: WebsiteId(r.get("website_id")),
        job_id: r.get::<Option<Uuid>, _>("job_id").map(JobId),
        url: r.get("url"),
        url_hash: r.get("url_hash"),
        content_hash: ContentDigest(r.get("content_hash")),
        content: r.get("content"),
        title: r.get("title"),
        is_duplicate: r.get("is_duplicate"),
        duplicate_of: r.get::<Option<Uuid>, _>("duplicate_of").map(PageId),
        similarity_score: r.get("similarity_score"),
        fetched_at: r.get("fetched_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn group_from_row(r: &PgRow) -> Result<DuplicateGroup> {
    Ok(DuplicateGroup {
        id: GroupId(r.get("id")),
        website_id: WebsiteId(r.get("website_id")),
        canonical_page_id: PageId(r.get("canonical_page_id")),
        group_size: r.get("group_size"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn relationship_from_row(r: &PgRow) -> Result<DuplicateRelationship> {
    Ok(DuplicateRelationship {
        id: RelationshipId(r.get("id")),
        group_id: GroupId(r.get("group_id")),
        page_id: PageId(r.get("page_id")),
        method: r.get::<String, _>("method").parse()?,
        similarity_score: r.get("similarity_score"),
        created_at: r.get("created_at"),
    })
}

#[async_trait]
impl DedupStore for PostgresDedupStore {
    async fn upsert_fingerprint(
        &self,
        digest: &ContentDigest,
        first_page: PageId,
        simhash: SimHash,
        now: DateTime<Utc>,
    ) -> Result<FingerprintEntry> {
        let row = sqlx::query(
            r#"
            INSERT INTO content_fingerprints
                (digest, first_page_id, occurrence_count, simhash, first_seen_at, last_seen_at)
            VALUES ($1, $2, 1, $3, $4, $4)
            ON CONFLICT (digest) DO UPDATE SET
                occurrence_count = content_fingerprints.occurrence_count + 1,
                simhash = EXCLUDED.simhash,
                last_seen_at = EXCLUDED.last_seen_at
            RETURNING digest, first_page_id, occurrence_count, simhash,
                      first_seen_at, last_seen_at
            "#,
        )
        .bind(digest.as_str())
        .bind(first_page.0)
        .bind(simhash.0 as i64)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert content fingerprint")?;
        fingerprint_from_row(&row)
    }

    async fn nearest_fingerprints(
        &self,
        simhash: SimHash,
        exclude_digest: &ContentDigest,
        max_distance: u32,
        limit: i64,
    ) -> Result<Vec<NearCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT digest, first_page_id,
                   bit_count((simhash # $1)::bit(64))::int AS distance
            FROM content_fingerprints
            WHERE digest <> $2
              AND bit_count((simhash # $1)::bit(64)) <= $3
            ORDER BY distance ASC, digest ASC
            LIMIT $4
            "#,
        )
        .bind(simhash.0 as i64)
        .bind(exclude_digest.as_str())
        .bind(max_distance as i32)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query nearest fingerprints")?;

        rows.iter()
            .map(|r| {
                Ok(NearCandidate {
                    digest: ContentDigest(r.get("digest")),
                    first_page_id: PageId(r.get("first_page_id")),
                    distance: r.get::<i32, _>("distance") as u32,
                })
            })
            .collect()
    }

    async fn upsert_page(&self, page: &CrawledPage) -> Result<CrawledPage> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin page upsert transaction")?;

        let existing = sqlx::query(&format!(
            "SELECT {PAGE_COLUMNS} FROM crawled_pages \
             WHERE website_id = $1 AND url_hash = $2 FOR UPDATE"
        ))
        .bind(page.website_id.0)
        .bind(&page.url_hash)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to look up existing page")?;

        let stored = match existing {
            Some(row) => {
                let existing = page_from_row(&row)?;
                let content_changed = existing.content_hash != page.content_hash;

                if content_changed {
                    // Changed content gets a fresh verdict; drop any stale
                    // group membership so size stays consistent.
                    let removed = sqlx::query(
                        "DELETE FROM duplicate_relationships WHERE page_id = $1 \
                         RETURNING group_id",
                    )
                    .bind(existing.id.0)
                    .fetch_optional(&mut *tx)
                    .await
                    .context("Failed to detach page from group")?;
                    if let Some(r) = removed {
                        sqlx::query(
                            "UPDATE duplicate_groups \
                             SET group_size = group_size - 1, updated_at = $2 WHERE id = $1",
                        )
                        .bind(r.get::<Uuid, _>("group_id"))
                        .bind(Utc::now())
                        .execute(&mut *tx)
                        .await
                        .context("Failed to shrink group after detach")?;
                    }
                }

                let row = sqlx::query(&format!(
                    "UPDATE crawled_pages SET \
                         content = $2, title = $3, content_hash = $4, job_id = $5, \
                         fetched_at = $6, updated_at = $7, \
                         is_duplicate = CASE WHEN $8 THEN FALSE ELSE is_duplicate END, \
                         duplicate_of = CASE WHEN $8 THEN NULL ELSE duplicate_of END, \
                         similarity_score = CASE WHEN $8 THEN NULL ELSE similarity_score END \
                     WHERE id = $1 RETURNING {PAGE_COLUMNS}"
                ))
                .bind(existing.id.0)
                .bind(&page.content)
                .bind(&page.title)
                .bind(page.content_hash.as_str())
                .bind(page.job_id.map(|j| j.0))
                .bind(page.fetched_at)
                .bind(Utc::now())
                .bind(content_changed)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to update existing page")?;
                page_from_row(&row)?
            }
            None => {
                sqlx::query(&format!(
                    "INSERT INTO crawled_pages ({PAGE_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
                ))
                .bind(page.id.0)
                .bind(page.website_id.0)
                .bind(page.job_id.map(|j| j.0))
                .bind(&page.url)
                .bind(&page.url_hash)
                .bind(page.content_hash.as_str())
                .bind(&page.content)
                .bind(&page.title)
                .bind(page.is_duplicate)
                .bind(page.duplicate_of.map(|p| p.0))
                .bind(page.similarity_score)
                .bind(page.fetched_at)
                .bind(page.created_at)
                .bind(page.updated_at)
                .execute(&mut *tx)
                .await
                .context("Failed to insert page")?;
                page.clone()
            }
        };

        tx.commit()
            .await
            .context("Failed to commit page upsert transaction")?;
        Ok(stored)
    }

    async fn get_page(&self, id: PageId) -> Result<Option<CrawledPage>> {
        let row = sqlx::query(&format!(
            "SELECT {PAGE_COLUMNS} FROM crawled_pages WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get page")?;
        row.as_ref().map(page_from_row).transpose()
    }

    async fn mark_duplicate(&self, page: PageId, of: PageId, score: f64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE crawled_pages SET \
                 is_duplicate = TRUE, duplicate_of = $2, similarity_score = $3, updated_at = $4 \
             WHERE id = $1",
        )
        .bind(page.0)
        .bind(of.0)
        .bind(score)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to mark page as duplicate")?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("page {page} does not exist"));
        }
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
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin group attach transaction")?;
        let now = Utc::now();

        // Find-or-create keyed by canonical page id; racing attachers
        // converge on whichever row won the insert.
        sqlx::query(
            "INSERT INTO duplicate_groups \
                 (id, website_id, canonical_page_id, group_size, created_at, updated_at) \
             VALUES ($1, $2, $3, 1, $4, $4) \
             ON CONFLICT (canonical_page_id) DO NOTHING",
        )
        .bind(GroupId::new().0)
        .bind(website_id.0)
        .bind(canonical_page.0)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to find-or-create duplicate group")?;

        let group_id: Uuid = sqlx::query(
            "SELECT id FROM duplicate_groups WHERE canonical_page_id = $1 FOR UPDATE",
        )
        .bind(canonical_page.0)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to load duplicate group")?
        .get("id");

        let inserted = sqlx::query(
            "INSERT INTO duplicate_relationships \
                 (id, group_id, page_id, method, similarity_score, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (page_id) DO NOTHING",
        )
        .bind(RelationshipId::new().0)
        .bind(group_id)
        .bind(duplicate_page.0)
        .bind(method.as_str())
        .bind(score)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to insert duplicate relationship")?;

        let final_group = if inserted.rows_affected() > 0 {
            sqlx::query(
                "UPDATE duplicate_groups \
                 SET group_size = group_size + 1, updated_at = $2 WHERE id = $1",
            )
            .bind(group_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to grow duplicate group")?;
            group_id
        } else {
            // Page already belongs to a group; report that one.
            sqlx::query("SELECT group_id FROM duplicate_relationships WHERE page_id = $1")
                .bind(duplicate_page.0)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to load existing membership")?
                .get("group_id")
        };

        tx.commit()
            .await
            .context("Failed to commit group attach transaction")?;
        Ok(GroupId(final_group))
    }

    async fn group_for_page(&self, page: PageId) -> Result<Option<DuplicateGroup>> {
        let row = sqlx::query(
            r#"
            SELECT DISTINCT g.id, g.website_id, g.canonical_page_id, g.group_size,
                   g.created_at, g.updated_at
            FROM duplicate_groups g
            LEFT JOIN duplicate_relationships r ON r.group_id = g.id
            WHERE g.canonical_page_id = $1 OR r.page_id = $1
            LIMIT 1
            "#,
        )
        .bind(page.0)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up group for page")?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn relationships_for_group(
        &self,
        group: GroupId,
    ) -> Result<Vec<DuplicateRelationship>> {
        let rows = sqlx::query(
            "SELECT id, group_id, page_id, method, similarity_score, created_at \
             FROM duplicate_relationships WHERE group_id = $1 ORDER BY created_at ASC",
        )
        .bind(group.0)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list group relationships")?;
        rows.iter().map(relationship_from_row).collect()
    }

    async fn orphan_duplicates(&self, limit: i64) -> Result<Vec<CrawledPage>> {
        let rows = sqlx::query(&format!(
            "SELECT {cols} FROM crawled_pages p \
             LEFT JOIN duplicate_relationships r ON r.page_id = p.id \
             WHERE p.is_duplicate AND p.duplicate_of IS NOT NULL AND r.id IS NULL \
             ORDER BY p.created_at ASC LIMIT $1",
            cols = PAGE_COLUMNS
                .split(", ")
                .map(|c| format!("p.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list orphan duplicates")?;
        rows.iter().map(page_from_row).collect()
    }
}
