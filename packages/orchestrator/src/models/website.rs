//! Website crawl target template.
//!
//! Websites are owned by the administrative layer; the orchestration core
//! only reads them to resolve templated job configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{WebsiteId, WebsiteStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Website {
    pub id: WebsiteId,
    /// Unique human-facing name.
    pub name: String,
    pub base_url: String,
    /// Structured crawl configuration document.
    pub config: serde_json::Value,
    /// Default recurrence schedule applied when a ScheduledJob carries none.
    pub default_schedule: Option<String>,
    pub status: WebsiteStatus,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Website {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, config: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: WebsiteId::new(),
            name: name.into(),
            base_url: base_url.into(),
            config,
            default_schedule: None,
            status: WebsiteStatus::Active,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_default_schedule(mut self, expression: impl Into<String>) -> Self {
        self.default_schedule = Some(expression.into());
        self
    }

    /// Soft-deleted or archived websites no longer produce scheduled work.
    pub fn is_crawlable(&self) -> bool {
        self.deleted_at.is_none() && self.status == WebsiteStatus::Active
    }
}
