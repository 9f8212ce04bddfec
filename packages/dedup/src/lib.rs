//! Content deduplication for the crawling platform.
//!
//! Two-tier detection over fetched pages: an exact SHA256 digest registry
//! catches byte-equivalent content, a 64-bit SimHash neighborhood search
//! catches near-duplicates, and matched pages are clustered into groups
//! around the first-seen canonical page.

pub mod config;
pub mod engine;
pub mod simhash;
pub mod storage;
pub mod types;

pub use config::DedupConfig;
pub use engine::{DedupEngine, DedupOutcome, DedupReport};
pub use simhash::SimHash;
pub use storage::{DedupStore, MemoryDedupStore, NearCandidate, PostgresDedupStore};
pub use types::{
    ContentDigest, CrawledPage, DetectionMethod, DuplicateGroup, DuplicateRelationship,
    FetchedPage, FingerprintEntry, GroupId, PageId, RelationshipId,
};
