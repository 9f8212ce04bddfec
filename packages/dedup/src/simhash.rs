//! 64-bit SimHash over word 3-gram shingles.
//!
//! Feature hashes come from SHA256 truncated to 64 bits, so fingerprints
//! are stable across processes and toolchain versions.

use sha2::{Digest, Sha256};

use crate::types::normalize_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimHash(pub u64);

impl SimHash {
    /// Compute the fingerprint for extracted text.
    pub fn compute(text: &str) -> Self {
        let normalized = normalize_text(text);
        let features = extract_features(&normalized);
        SimHash(vote(&features))
    }

    /// Number of differing bits between two fingerprints.
    pub fn hamming_distance(&self, other: &SimHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn is_similar(&self, other: &SimHash, max_distance: u32) -> bool {
        self.hamming_distance(other) <= max_distance
    }
}

/// Word 3-gram shingles; short texts fall back to individual words.
fn extract_features(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < 3 {
        return words.iter().map(|s| s.to_string()).collect();
    }
    words.windows(3).map(|w| w.join(" ")).collect()
}

fn feature_hash(feature: &str) -> u64 {
    let digest = Sha256::digest(feature.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap_or([0; 8]))
}

/// Classic bit voting: each feature votes +1/-1 per bit position, the
/// sign of the tally decides the output bit.
fn vote(features: &[String]) -> u64 {
    if features.is_empty() {
        return 0;
    }

    let mut tallies = [0i64; 64];
    for feature in features {
        let hash = feature_hash(feature);
        for (bit, tally) in tallies.iter_mut().enumerate() {
            if hash & (1u64 << bit) != 0 {
                *tally += 1;
            } else {
                *tally -= 1;
            }
        }
    }

    let mut result = 0u64;
    for (bit, tally) in tallies.iter().enumerate() {
        if *tally > 0 {
            result |= 1u64 << bit;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_has_distance_zero() {
        let text = "The quick brown fox jumps over the lazy dog";
        let a = SimHash::compute(text);
        let b = SimHash::compute(text);
        assert_eq!(a, b);
        assert_eq!(a.hamming_distance(&b), 0);
    }

    #[test]
    fn one_word_change_stays_close() {
        let a = SimHash::compute("The quick brown fox jumps over the lazy dog and runs away fast");
        let b = SimHash::compute("The quick brown fox leaps over the lazy dog and runs away fast");
        let distance = a.hamming_distance(&b);
        assert!(distance < 32, "expected low distance, got {distance}");
    }

    #[test]
    fn unrelated_text_is_far_apart() {
        let a = SimHash::compute("The quick brown fox jumps over the lazy dog");
        let b = SimHash::compute("Lorem ipsum dolor sit amet consectetur adipiscing elit");
        let distance = a.hamming_distance(&b);
        assert!(distance > 10, "expected high distance, got {distance}");
    }

    #[test]
    fn formatting_noise_does_not_move_the_fingerprint() {
        let a = SimHash::compute("Hello, World! This is a test.");
        let b = SimHash::compute("hello world this is a test");
        assert_eq!(a.hamming_distance(&b), 0);
    }

    #[test]
    fn short_text_falls_back_to_words() {
        let a = SimHash::compute("hello world");
        let b = SimHash::compute("hello world");
        assert_eq!(a, b);
        assert_ne!(a.0, 0);
    }

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(SimHash::compute("").0, 0);
    }

    #[test]
    fn similarity_respects_threshold() {
        let a = SimHash(0b1111);
        let b = SimHash(0b1000);
        assert_eq!(a.hamming_distance(&b), 3);
        assert!(a.is_similar(&b, 5));
        assert!(!a.is_similar(&b, 2));
    }
}
