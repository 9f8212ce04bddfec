//! Terminal record for permanently abandoned jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeadLetterId, ErrorCategory, FetchFailure, JobId, ResolutionState, WebsiteId};

/// One entry per permanently failed job; creation is idempotent per job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub job_id: JobId,
    pub website_id: Option<WebsiteId>,
    pub category: ErrorCategory,
    pub message: String,
    pub stack_trace: Option<String>,
    pub http_status: Option<i32>,
    /// Total attempts made before abandonment (including the first).
    pub attempt_count: i32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub resolution: ResolutionState,
    pub resolution_notes: Option<String>,
    /// Outcome note of the most recent manual retry, if any.
    pub manual_retry_outcome: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_failure(
        job_id: JobId,
        website_id: Option<WebsiteId>,
        failure: &FetchFailure,
        attempt_count: i32,
        first_attempt_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DeadLetterId::new(),
            job_id,
            website_id,
            category: failure.category,
            message: failure.message.clone(),
            stack_trace: failure.stack_trace.clone(),
            http_status: failure.http_status,
            attempt_count,
            first_attempt_at,
            last_attempt_at: now,
            resolution: ResolutionState::Unresolved,
            resolution_notes: None,
            manual_retry_outcome: None,
            resolved_at: None,
            created_at: now,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution == ResolutionState::Resolved
    }
}
