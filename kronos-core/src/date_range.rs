//! Time ranges for queries and recurrence expansion.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::error::{KronosError, KronosResult};

/// Half-open time range `[from, to)`. None values mean unbounded in that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        DateRange {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn unbounded() -> Self {
        DateRange::default()
    }

    /// The recurrence expansion window around `now`.
    pub fn expansion(now: DateTime<Utc>, past_days: i64, future_days: i64) -> Self {
        DateRange::new(
            now - Duration::days(past_days),
            now + Duration::days(future_days),
        )
    }

    /// Parse query bounds.
    /// - `from`: YYYY-MM-DD (start of day) or RFC3339; unbounded when absent
    /// - `to`: YYYY-MM-DD (exclusive next midnight) or RFC3339; unbounded when absent
    pub fn from_args(from: Option<&str>, to: Option<&str>) -> KronosResult<Self> {
        let from = from.map(parse_date_start).transpose()?;
        let to = to.map(parse_date_end).transpose()?;

        if let (Some(f), Some(t)) = (from, to) {
            if t <= f {
                return Err(KronosError::Config(format!(
                    "Range end {t} is not after start {f}"
                )));
            }
        }

        Ok(DateRange { from, to })
    }

    /// Whether `[start, end)` intersects this range.
    pub fn intersects(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| end > from) && self.to.is_none_or(|to| start < to)
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| instant >= from) && self.to.is_none_or(|to| instant < to)
    }
}

fn parse_date_start(s: &str) -> KronosResult<DateTime<Utc>> {
    parse_bound(s, 0)
}

fn parse_date_end(s: &str) -> KronosResult<DateTime<Utc>> {
    parse_bound(s, 1)
}

fn parse_bound(s: &str, day_offset: i64) -> KronosResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
        KronosError::Config(format!(
            "Invalid date format '{s}'. Expected YYYY-MM-DD or RFC3339"
        ))
    })?;
    let midnight = (date + Duration::days(day_offset))
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| KronosError::Config(format!("Date out of range: '{s}'")))?;
    Ok(midnight.and_utc())
}
