//! Pure recurrence-expression helpers.
//!
//! Wraps the `cron` crate so the rest of the engine treats a schedule
//! string as an opaque function from an instant to the next fire time.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid recurrence expression {expression:?}: {source}")]
    Invalid {
        expression: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("recurrence expression {expression:?} never fires after {after}")]
    Exhausted {
        expression: String,
        after: DateTime<Utc>,
    },
}

/// Validate an expression without computing anything.
pub fn validate(expression: &str) -> Result<(), ScheduleError> {
    parse(expression).map(|_| ())
}

/// Next instant strictly after `after` at which the expression fires.
pub fn next_fire_after(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let schedule = parse(expression)?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| ScheduleError::Exhausted {
            expression: expression.to_string(),
            after,
        })
}

fn parse(expression: &str) -> Result<Schedule, ScheduleError> {
    Schedule::from_str(expression).map_err(|source| ScheduleError::Invalid {
        expression: expression.to_string(),
        source,
    })
}
