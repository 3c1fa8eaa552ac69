//! Pickup-time parsing and window checks.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::error::ValidationError;
use crate::reservation::Answer;

static RELATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\+(\d+)\s*(min|hour)s?$").expect("relative time pattern is valid")
});

/// Resolve an answer into a pickup time within `[now, now + max_advance]`.
///
/// Accepts a structured date-time, `now`, `+N min` / `+N hour` and RFC 3339
/// text. Both window edges are inclusive.
pub fn validate_time(
    answer: &Answer,
    now: DateTime<Utc>,
    max_advance: Duration,
) -> Result<DateTime<Utc>, ValidationError> {
    let t = match answer {
        Answer::DateTime(t) => *t,
        Answer::Text(text) => parse_time_text(text, now)?,
        _ => return Err(ValidationError::NotATime),
    };

    if t < now {
        return Err(ValidationError::TimeInPast);
    }
    if t - now > max_advance {
        return Err(ValidationError::TimeTooFarOut {
            max_hours: max_advance.num_hours(),
        });
    }
    Ok(t)
}

fn parse_time_text(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ValidationError> {
    let lowered = text.trim().to_lowercase();
    if lowered == "now" {
        return Ok(now);
    }

    if let Some(caps) = RELATIVE.captures(&lowered) {
        let n: i64 = caps[1].parse().map_err(|_| ValidationError::NotATime)?;
        let offset = match &caps[2] {
            "min" => Duration::try_minutes(n),
            _ => Duration::try_hours(n),
        };
        // Overflow saturates so the window check reports it as too far out.
        return Ok(offset
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC));
    }

    DateTime::parse_from_rfc3339(text.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ValidationError::NotATime)
}
