//! RRULE expansion for recurring series.
//!
//! Expands a series master into concrete occurrences inside a bounded window,
//! respecting EXDATEs. Exceptions reported by the provider are applied by the
//! normalizer on top of what this returns.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;

use crate::date_range::DateRange;
use crate::raw::{EventTime, Recurrence};

/// One generated occurrence of a series.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedOccurrence {
    /// Original start of the occurrence; identifies it within the series.
    pub recurrence_id: DateTime<Utc>,
    pub start: EventTime,
    pub end: EventTime,
}

fn ics_time(prop: &str, time: &EventTime, anchor: Tz) -> String {
    match time {
        // the rrule crate needs a datetime, so all-day dates become midnight UTC
        EventTime::Date(d) => format!("{prop}:{}T000000Z", d.format("%Y%m%d")),
        EventTime::DateTimeUtc(dt) => format!("{prop}:{}", dt.format("%Y%m%dT%H%M%SZ")),
        EventTime::DateTimeFloating(dt) => {
            format!("{prop};TZID={}:{}", anchor.name(), dt.format("%Y%m%dT%H%M%S"))
        }
        EventTime::DateTimeZoned { datetime, tzid } => {
            format!("{prop};TZID={}:{}", tzid, datetime.format("%Y%m%dT%H%M%S"))
        }
    }
}

/// Build an iCalendar-format rule set string for the rrule crate parser.
fn build_rrule_string(start: &EventTime, recurrence: &Recurrence, anchor: Tz) -> String {
    let mut lines = vec![
        ics_time("DTSTART", start, anchor),
        format!("RRULE:{}", recurrence.rrule),
    ];
    lines.extend(
        recurrence
            .exdates
            .iter()
            .map(|exdate| ics_time("EXDATE", exdate, anchor)),
    );
    lines.join("\n")
}

/// Convert an rrule occurrence back to an EventTime matching the master's variant.
fn occurrence_time(dt: &DateTime<rrule::Tz>, master_start: &EventTime) -> EventTime {
    match master_start {
        EventTime::Date(_) => EventTime::Date(dt.with_timezone(&Utc).date_naive()),
        EventTime::DateTimeUtc(_) => EventTime::DateTimeUtc(dt.with_timezone(&Utc)),
        EventTime::DateTimeFloating(_) => EventTime::DateTimeFloating(dt.naive_local()),
        EventTime::DateTimeZoned { tzid, .. } => EventTime::DateTimeZoned {
            datetime: dt.naive_local(),
            tzid: tzid.clone(),
        },
    }
}

/// End of an occurrence, preserving the master's wall-clock length.
fn occurrence_end(occ_start: &EventTime, master_start: &EventTime, master_end: &EventTime) -> EventTime {
    match (occ_start, master_start, master_end) {
        (EventTime::Date(occ), EventTime::Date(s), EventTime::Date(e)) => {
            EventTime::Date(*occ + Duration::days((*e - *s).num_days()))
        }
        (EventTime::DateTimeUtc(occ), EventTime::DateTimeUtc(s), EventTime::DateTimeUtc(e)) => {
            EventTime::DateTimeUtc(*occ + (*e - *s))
        }
        (
            EventTime::DateTimeFloating(occ),
            EventTime::DateTimeFloating(s),
            EventTime::DateTimeFloating(e),
        ) => EventTime::DateTimeFloating(*occ + (*e - *s)),
        (
            EventTime::DateTimeZoned { datetime, tzid },
            EventTime::DateTimeZoned { datetime: s, .. },
            EventTime::DateTimeZoned { datetime: e, .. },
        ) => EventTime::DateTimeZoned {
            datetime: *datetime + (*e - *s),
            tzid: tzid.clone(),
        },
        // Mixed variants: fall back to the absolute length.
        _ => {
            let length = match (master_start.to_utc(Tz::UTC), master_end.to_utc(Tz::UTC)) {
                (Some(s), Some(e)) => e - s,
                _ => Duration::zero(),
            };
            match occ_start.to_utc(Tz::UTC) {
                Some(s) => EventTime::DateTimeUtc(s + length),
                None => occ_start.clone(),
            }
        }
    }
}

/// Expand a series master into occurrences whose start falls inside `window`.
///
/// At most `limit` occurrences are produced. Errors carry a description of
/// why the rule could not be parsed; callers treat that as a malformed record.
pub fn expand_series(
    start: &EventTime,
    end: &EventTime,
    recurrence: &Recurrence,
    window: &DateRange,
    anchor: Tz,
    limit: u16,
) -> Result<Vec<ExpandedOccurrence>, String> {
    let rrule_str = build_rrule_string(start, recurrence, anchor);
    let rrule_set: RRuleSet = rrule_str
        .parse()
        .map_err(|e| format!("invalid recurrence rule '{}': {e}", recurrence.rrule))?;

    // Widen by one second: after/before are exclusive.
    let tz: rrule::Tz = Utc.into();
    let mut rrule_set = rrule_set;
    if let Some(from) = window.from {
        rrule_set = rrule_set.after((from - Duration::seconds(1)).with_timezone(&tz));
    }
    if let Some(to) = window.to {
        rrule_set = rrule_set.before((to + Duration::seconds(1)).with_timezone(&tz));
    }

    let result = rrule_set.all(limit);

    let occurrences = result
        .dates
        .iter()
        .filter_map(|occ| {
            let occ_start = occurrence_time(occ, start);
            let recurrence_id = occ_start.to_utc(anchor)?;
            if !window.contains(recurrence_id) {
                return None;
            }
            let occ_end = occurrence_end(&occ_start, start, end);
            Some(ExpandedOccurrence {
                recurrence_id,
                start: occ_start,
                end: occ_end,
            })
        })
        .collect();

    Ok(occurrences)
}
