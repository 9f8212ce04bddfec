//! Retry policy table and per-attempt history records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BackoffStrategy, ErrorCategory, JobId, RetryAttemptId};

/// Per error-category retry rule, consulted by the lifecycle engine on
/// every failure. Administratively updated; read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub max_attempts: i32,
    pub backoff: BackoffStrategy,
    pub initial_delay_secs: i64,
    pub max_delay_secs: i64,
    pub backoff_multiplier: f64,
    pub updated_at: DateTime<Utc>,
}

impl RetryPolicy {
    pub fn retryable(category: ErrorCategory, max_attempts: i32) -> Self {
        Self {
            category,
            retryable: true,
            max_attempts,
            backoff: BackoffStrategy::Exponential,
            initial_delay_secs: 30,
            max_delay_secs: 3600,
            backoff_multiplier: 2.0,
            updated_at: Utc::now(),
        }
    }

    pub fn non_retryable(category: ErrorCategory) -> Self {
        Self {
            category,
            retryable: false,
            max_attempts: 0,
            backoff: BackoffStrategy::Fixed,
            initial_delay_secs: 0,
            max_delay_secs: 0,
            backoff_multiplier: 1.0,
            updated_at: Utc::now(),
        }
    }

    pub fn with_backoff(
        mut self,
        backoff: BackoffStrategy,
        initial_delay_secs: i64,
        max_delay_secs: i64,
        multiplier: f64,
    ) -> Self {
        self.backoff = backoff;
        self.initial_delay_secs = initial_delay_secs;
        self.max_delay_secs = max_delay_secs;
        self.backoff_multiplier = multiplier;
        self
    }

    /// Built-in defaults for every known category. Used when the store has
    /// no administratively configured row for a category.
    pub fn default_for(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::TransientNetwork => Self::retryable(category, 5),
            ErrorCategory::RateLimited => Self::retryable(category, 5).with_backoff(
                BackoffStrategy::Exponential,
                60,
                7200,
                2.0,
            ),
            ErrorCategory::ExecutionTimeout => Self::retryable(category, 3),
            ErrorCategory::Unknown => Self::retryable(category, 3),
            ErrorCategory::Authentication
            | ErrorCategory::ContentMalformed
            | ErrorCategory::PermanentNotFound => Self::non_retryable(category),
        }
    }

    /// The full built-in policy table.
    pub fn default_table() -> Vec<Self> {
        ErrorCategory::ALL.iter().map(|c| Self::default_for(*c)).collect()
    }
}

/// Append-only record of a single failed attempt. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryHistory {
    pub id: RetryAttemptId,
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt: i32,
    pub category: ErrorCategory,
    pub message: String,
    pub stack_trace: Option<String>,
    /// Delay computed for the next attempt; None when the failure was terminal.
    pub delay_secs: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

impl RetryHistory {
    pub fn record(
        job_id: JobId,
        attempt: i32,
        category: ErrorCategory,
        message: impl Into<String>,
        stack_trace: Option<String>,
        delay_secs: Option<i64>,
    ) -> Self {
        Self {
            id: RetryAttemptId::new(),
            job_id,
            attempt,
            category,
            message: message.into(),
            stack_trace,
            delay_secs,
            recorded_at: Utc::now(),
        }
    }
}
