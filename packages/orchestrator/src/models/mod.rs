pub mod dead_letter;
pub mod job;
pub mod retry;
pub mod schedule;
pub mod website;

pub use dead_letter::DeadLetterEntry;
pub use job::CrawlJob;
pub use retry::{RetryHistory, RetryPolicy};
pub use schedule::ScheduledJob;
pub use website::Website;
