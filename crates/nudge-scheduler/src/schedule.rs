//! Cron schedule evaluation against wall-clock time, per job timezone.
//!
//! Expressions are standard 5-field cron ("MIN HOUR DOM MON DOW"); the
//! `cron` crate wants a seconds field, so 5-field input is normalized by
//! prepending `0`. Six- and seven-field expressions pass through untouched.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use nudge_core::error::{NudgeError, Result};

/// Compute the earliest occurrence of `expression` in `timezone` strictly
/// after `after`. Returns None for malformed expressions or unknown
/// timezones — the record stays perpetually non-due instead of crashing
/// the sweep.
pub fn next_occurrence(
    expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let schedule = match parse(expression) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Unschedulable cron expression: {e}");
            return None;
        }
    };
    let tz: Tz = match timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!("Unknown timezone '{timezone}', job stays non-due");
            return None;
        }
    };

    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Validate a schedule/timezone pair. Used at every write site so malformed
/// schedules are rejected instead of persisted.
pub fn validate(expression: &str, timezone: &str) -> Result<()> {
    parse(expression)?;
    timezone
        .parse::<Tz>()
        .map_err(|_| NudgeError::Schedule(format!("Unknown timezone: {timezone}")))?;
    Ok(())
}

fn parse(expression: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize(expression))
        .map_err(|e| NudgeError::Schedule(format!("'{expression}': {e}")))
}

/// Prepend a seconds field to 5-field expressions.
fn normalize(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}
