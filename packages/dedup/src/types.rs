//! Data model for content fingerprinting and duplicate clustering.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use orchestrator::{JobId, WebsiteId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a crawled page.
    PageId
);
uuid_id!(
    /// Unique identifier for a duplicate group.
    GroupId
);
uuid_id!(
    /// Unique identifier for a group membership record.
    RelationshipId
);

/// Normalize extracted text for hashing: lowercase, strip everything that
/// is not alphanumeric or whitespace, collapse runs of whitespace.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Exact content digest: SHA256 hex of normalized text.
///
/// Robust against formatting noise (case, punctuation, whitespace) while
/// still changing on any meaningful content change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(pub String);

impl ContentDigest {
    pub fn from_content(text: &str) -> Self {
        let normalized = normalize_text(text);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a duplicate relationship was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    ExactHash,
    SimhashFingerprint,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::ExactHash => "exact_hash",
            DetectionMethod::SimhashFingerprint => "simhash_fingerprint",
        }
    }
}

impl FromStr for DetectionMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact_hash" => Ok(DetectionMethod::ExactHash),
            "simhash_fingerprint" => Ok(DetectionMethod::SimhashFingerprint),
            other => Err(anyhow::anyhow!("unknown detection method: {other}")),
        }
    }
}

/// Input handed over by the fetcher/extractor after a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub website_id: WebsiteId,
    pub job_id: Option<JobId>,
    pub url: String,
    pub content: String,
    pub title: Option<String>,
}

impl FetchedPage {
    pub fn new(
        website_id: WebsiteId,
        url: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            website_id,
            job_id: None,
            url: url.into(),
            content: content.into(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

/// One fetched page, keyed (website_id, url_hash). Re-crawling the same
/// URL updates the row in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawledPage {
    pub id: PageId,
    pub website_id: WebsiteId,
    pub job_id: Option<JobId>,
    pub url: String,
    /// SHA256 hex of the raw URL; unique per website.
    pub url_hash: String,
    pub content_hash: ContentDigest,
    pub content: String,
    pub title: Option<String>,
    /// Derived from group membership; the repair pass re-attaches any row
    /// where the two drift apart.
    pub is_duplicate: bool,
    pub duplicate_of: Option<PageId>,
    pub similarity_score: Option<f64>,
    pub fetched_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrawledPage {
    pub fn from_fetched(input: &FetchedPage) -> Self {
        let now = Utc::now();
        Self {
            id: PageId::new(),
            website_id: input.website_id,
            job_id: input.job_id,
            url: input.url.clone(),
            url_hash: hash_url(&input.url),
            content_hash: ContentDigest::from_content(&input.content),
            content: input.content.clone(),
            title: input.title.clone(),
            is_duplicate: false,
            duplicate_of: None,
            similarity_score: None,
            fetched_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn hash_url(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fingerprint registry row, keyed by exact content digest.
///
/// `first_page_id` never changes once set; every later sighting bumps the
/// occurrence count and refreshes the fingerprint and last-seen timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub digest: ContentDigest,
    pub first_page_id: PageId,
    pub occurrence_count: i64,
    /// 64-bit SimHash of the most recent sighting.
    pub simhash: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// A cluster of duplicate pages around one canonical page.
///
/// `group_size` counts member pages including the canonical: 1 at
/// creation, 2 after the first duplicate attaches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: GroupId,
    pub website_id: WebsiteId,
    pub canonical_page_id: PageId,
    pub group_size: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Membership of one duplicate page in a group. A page appears as a
/// duplicate in at most one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateRelationship {
    pub id: RelationshipId,
    pub group_id: GroupId,
    pub page_id: PageId,
    pub method: DetectionMethod,
    pub similarity_score: f64,
    pub created_at: DateTime<Utc>,
}
