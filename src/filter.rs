use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Comparison, Membership};

const DAYS_PER_WEEK: i64 = 7;

/// Completion window `(start, end]`: a roll completed exactly at `start`
/// is outside, one completed exactly at `end` is inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// The window covering the `number_of_weeks` weeks that end at `now`.
pub fn time_window(now: DateTime<Utc>, number_of_weeks: i32) -> Result<Window> {
    if number_of_weeks < 1 {
        return Err(Error::InvalidParameter(format!(
            "number_of_weeks must be at least 1, got {number_of_weeks}"
        )));
    }

    let span = Duration::try_days(i64::from(number_of_weeks) * DAYS_PER_WEEK)
        .ok_or_else(|| Error::InvalidParameter(format!("{number_of_weeks} weeks is out of range")))?;
    let start = now
        .checked_sub_signed(span)
        .ok_or_else(|| Error::InvalidParameter(format!("{number_of_weeks} weeks is out of range")))?;

    Ok(Window { start, end: now })
}

/// Keeps the students whose count strictly passes the threshold, ordered by id.
pub fn apply_threshold(
    counts: HashMap<Uuid, i64>,
    comparison: Comparison,
    threshold: i32,
) -> Vec<Membership> {
    let mut members: Vec<Membership> = counts
        .into_iter()
        .filter(|(_, count)| comparison.admits(*count, i64::from(threshold)))
        .map(|(student_id, incident_count)| Membership {
            student_id,
            incident_count,
        })
        .collect();

    members.sort_by_key(|member| member.student_id);
    members
}
