//! Backoff delay computation for retry scheduling.

use chrono::Duration;

use crate::models::RetryPolicy;
use crate::types::BackoffStrategy;

/// Delay to wait before the given 1-based attempt re-enters candidacy.
///
/// Fixed: `initial`. Linear: `initial * attempt`. Exponential:
/// `initial * multiplier^(attempt - 1)`. All shapes are capped at the
/// policy's `max_delay_secs`.
pub fn compute_delay(policy: &RetryPolicy, attempt: i32) -> Duration {
    let attempt = attempt.max(1);
    let initial = policy.initial_delay_secs.max(0) as f64;

    let raw = match policy.backoff {
        BackoffStrategy::Fixed => initial,
        BackoffStrategy::Linear => initial * attempt as f64,
        BackoffStrategy::Exponential => {
            initial * policy.backoff_multiplier.powi(attempt - 1)
        }
    };

    let capped = raw.min(policy.max_delay_secs.max(0) as f64);
    Duration::seconds(capped.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorCategory;

    fn policy(backoff: BackoffStrategy, initial: i64, max: i64, mult: f64) -> RetryPolicy {
        RetryPolicy::retryable(ErrorCategory::TransientNetwork, 5)
            .with_backoff(backoff, initial, max, mult)
    }

    #[test]
    fn fixed_delay_ignores_attempt_number() {
        let p = policy(BackoffStrategy::Fixed, 30, 3600, 2.0);
        assert_eq!(compute_delay(&p, 1), Duration::seconds(30));
        assert_eq!(compute_delay(&p, 4), Duration::seconds(30));
    }

    #[test]
    fn linear_delay_scales_with_attempt() {
        let p = policy(BackoffStrategy::Linear, 10, 3600, 1.0);
        assert_eq!(compute_delay(&p, 1), Duration::seconds(10));
        assert_eq!(compute_delay(&p, 3), Duration::seconds(30));
    }

    #[test]
    fn exponential_attempt_three_with_multiplier_two() {
        // 30 * 2^(3-1) = 120
        let p = policy(BackoffStrategy::Exponential, 30, 3600, 2.0);
        assert_eq!(compute_delay(&p, 3), Duration::seconds(120));
    }

    #[test]
    fn exponential_first_attempt_uses_initial_delay() {
        let p = policy(BackoffStrategy::Exponential, 30, 3600, 2.0);
        assert_eq!(compute_delay(&p, 1), Duration::seconds(30));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let p = policy(BackoffStrategy::Exponential, 30, 100, 2.0);
        assert_eq!(compute_delay(&p, 10), Duration::seconds(100));
    }

    #[test]
    fn nonpositive_attempt_is_clamped() {
        let p = policy(BackoffStrategy::Exponential, 30, 3600, 2.0);
        assert_eq!(compute_delay(&p, 0), Duration::seconds(30));
    }
}
