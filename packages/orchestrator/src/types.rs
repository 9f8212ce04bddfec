//! Core identifiers and enums shared across the orchestration engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
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
    /// Unique identifier for a crawl target website.
    WebsiteId
);
uuid_id!(
    /// Unique identifier for a recurring schedule binding.
    ScheduleId
);
uuid_id!(
    /// Unique identifier for a crawl job.
    JobId
);
uuid_id!(
    /// Unique identifier for a dead letter entry.
    DeadLetterId
);
uuid_id!(
    /// Unique identifier for one retry attempt record.
    RetryAttemptId
);

/// Lifecycle status of a crawl job.
///
/// `Pending → Running → {Completed | Failed | Cancelled}`, with
/// `Failed` reachable back to `Pending` on retry and `Cancelled`
/// reachable from `Pending` or `Running` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the job has reached a state it can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown job status: {other}")),
        }
    }
}

/// How a job came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    #[default]
    OneTime,
    Scheduled,
    SeedSubmission,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::OneTime => "one_time",
            JobKind::Scheduled => "scheduled",
            JobKind::SeedSubmission => "seed_submission",
        }
    }
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(JobKind::OneTime),
            "scheduled" => Ok(JobKind::Scheduled),
            "seed_submission" => Ok(JobKind::SeedSubmission),
            other => Err(anyhow::anyhow!("unknown job kind: {other}")),
        }
    }
}

/// Job priority; higher runs first.
pub type Priority = i32;

/// Lifecycle status of a website template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WebsiteStatus {
    #[default]
    Active,
    Inactive,
    Archived,
}

impl WebsiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebsiteStatus::Active => "active",
            WebsiteStatus::Inactive => "inactive",
            WebsiteStatus::Archived => "archived",
        }
    }
}

impl FromStr for WebsiteStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WebsiteStatus::Active),
            "inactive" => Ok(WebsiteStatus::Inactive),
            "archived" => Ok(WebsiteStatus::Archived),
            other => Err(anyhow::anyhow!("unknown website status: {other}")),
        }
    }
}

/// Failure classification reported by the fetcher.
///
/// The engine never inspects raw errors, only this category, which keys
/// into the retry policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    TransientNetwork,
    RateLimited,
    Authentication,
    ContentMalformed,
    ExecutionTimeout,
    PermanentNotFound,
    #[default]
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        ErrorCategory::TransientNetwork,
        ErrorCategory::RateLimited,
        ErrorCategory::Authentication,
        ErrorCategory::ContentMalformed,
        ErrorCategory::ExecutionTimeout,
        ErrorCategory::PermanentNotFound,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::TransientNetwork => "transient_network",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::ContentMalformed => "content_malformed",
            ErrorCategory::ExecutionTimeout => "execution_timeout",
            ErrorCategory::PermanentNotFound => "permanent_not_found",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl FromStr for ErrorCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient_network" => Ok(ErrorCategory::TransientNetwork),
            "rate_limited" => Ok(ErrorCategory::RateLimited),
            "authentication" => Ok(ErrorCategory::Authentication),
            "content_malformed" => Ok(ErrorCategory::ContentMalformed),
            "execution_timeout" => Ok(ErrorCategory::ExecutionTimeout),
            "permanent_not_found" => Ok(ErrorCategory::PermanentNotFound),
            "unknown" => Ok(ErrorCategory::Unknown),
            other => Err(anyhow::anyhow!("unknown error category: {other}")),
        }
    }
}

/// Shape of the delay curve between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Exponential => "exponential",
        }
    }
}

impl FromStr for BackoffStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(anyhow::anyhow!("unknown backoff strategy: {other}")),
        }
    }
}

/// Resolution state of a dead letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    #[default]
    Unresolved,
    ManuallyRetried,
    Resolved,
}

impl ResolutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionState::Unresolved => "unresolved",
            ResolutionState::ManuallyRetried => "manually_retried",
            ResolutionState::Resolved => "resolved",
        }
    }
}

impl FromStr for ResolutionState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unresolved" => Ok(ResolutionState::Unresolved),
            "manually_retried" => Ok(ResolutionState::ManuallyRetried),
            "resolved" => Ok(ResolutionState::Resolved),
            other => Err(anyhow::anyhow!("unknown resolution state: {other}")),
        }
    }
}

/// Where a crawl job takes its configuration from.
///
/// Exactly one source exists by construction: either a website template
/// (possibly with a schedule-level override merged in by the scheduler)
/// or an inline configuration document supplied at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum JobSpec {
    Templated { website_id: WebsiteId },
    Inline { config: serde_json::Value },
}

impl JobSpec {
    pub fn website_id(&self) -> Option<WebsiteId> {
        match self {
            JobSpec::Templated { website_id } => Some(*website_id),
            JobSpec::Inline { .. } => None,
        }
    }

    pub fn inline_config(&self) -> Option<&serde_json::Value> {
        match self {
            JobSpec::Templated { .. } => None,
            JobSpec::Inline { config } => Some(config),
        }
    }
}

/// Failure contract reported by the external fetcher (§6 of the design).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchFailure {
    pub category: ErrorCategory,
    pub message: String,
    pub http_status: Option<i32>,
    pub stack_trace: Option<String>,
}

impl FetchFailure {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            http_status: None,
            stack_trace: None,
        }
    }

    pub fn with_http_status(mut self, status: i32) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }
}

/// Successful fetch result handed back by the external fetcher.
///
/// The orchestration core only forwards this to the dedup engine; it
/// never interprets the content itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub content: String,
    pub title: Option<String>,
    pub content_hash: String,
    pub simhash_fingerprint: u64,
    pub content_location: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn category_round_trips_through_str() {
        for category in ErrorCategory::ALL {
            assert_eq!(category.as_str().parse::<ErrorCategory>().unwrap(), category);
        }
    }

    #[test]
    fn job_spec_is_exactly_one_source() {
        let templated = JobSpec::Templated {
            website_id: WebsiteId::new(),
        };
        assert!(templated.website_id().is_some());
        assert!(templated.inline_config().is_none());

        let inline = JobSpec::Inline {
            config: serde_json::json!({"depth": 2}),
        };
        assert!(inline.website_id().is_none());
        assert!(inline.inline_config().is_some());
    }

    #[test]
    fn job_spec_serializes_with_source_tag() {
        let inline = JobSpec::Inline {
            config: serde_json::json!({"depth": 2}),
        };
        let value = serde_json::to_value(&inline).unwrap();
        assert_eq!(value["source"], "inline");
    }
}
