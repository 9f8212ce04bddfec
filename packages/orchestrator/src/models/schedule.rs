//! Recurrence binding between a website and a cron schedule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule_expr;
use crate::types::{ScheduleId, WebsiteId};

/// A recurring crawl schedule.
///
/// `next_run_at` is always the next instant at or after now for which the
/// recurrence fires, except in the window between a fire and the atomic
/// advance that makes the record visible to selection again. Mutated only
/// by the recurring scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: ScheduleId,
    pub website_id: WebsiteId,
    /// Cron expression, validated at creation time.
    pub recurrence: String,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub active: bool,
    /// Optional override merged over the website's config document.
    pub config_override: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Build a schedule, rejecting invalid recurrence expressions up front.
    pub fn new(
        website_id: WebsiteId,
        recurrence: impl Into<String>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Self> {
        let recurrence = recurrence.into();
        let next_run_at = schedule_expr::next_fire_after(&recurrence, now)?;
        Ok(Self {
            id: ScheduleId::new(),
            website_id,
            recurrence,
            next_run_at,
            last_run_at: None,
            active: true,
            config_override: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_config_override(mut self, config: serde_json::Value) -> Self {
        self.config_override = Some(config);
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_run_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn new_schedule_computes_first_fire() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let schedule = ScheduledJob::new(WebsiteId::new(), "0 0 0 * * *", now).unwrap();
        assert_eq!(
            schedule.next_run_at,
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
        );
        assert!(schedule.active);
    }

    #[test]
    fn invalid_expression_is_rejected_at_creation() {
        let result = ScheduledJob::new(WebsiteId::new(), "every other blue moon", Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn inactive_schedule_is_never_due() {
        let now = Utc::now();
        let mut schedule = ScheduledJob::new(WebsiteId::new(), "0 * * * * *", now).unwrap();
        schedule.next_run_at = now;
        assert!(schedule.is_due(now));
        schedule.active = false;
        assert!(!schedule.is_due(now));
    }
}
