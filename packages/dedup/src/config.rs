//! Tuning knobs for near-duplicate detection.

/// Configuration for the deduplication engine.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Maximum Hamming distance for a near-duplicate link.
    pub hamming_threshold: u32,
    /// Candidate cap for the nearest-fingerprint query.
    pub max_candidates: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            hamming_threshold: 5,
            max_candidates: 10,
        }
    }
}
