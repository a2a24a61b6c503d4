//! Provider-native records as fetched during one sync pass.
//!
//! These are ephemeral: adapters produce them, the normalizer consumes them,
//! and nothing persists them past the pass.

use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::event::{EventStatus, Transparency};

/// A point in time as the provider expressed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventTime {
    /// All-day date, anchored to the calendar's declared timezone.
    Date(NaiveDate),
    DateTimeUtc(DateTime<Utc>),
    /// Wall-clock time with no zone, anchored to the calendar's declared timezone.
    DateTimeFloating(NaiveDateTime),
    DateTimeZoned { datetime: NaiveDateTime, tzid: String },
}

impl EventTime {
    pub fn is_date(&self) -> bool {
        matches!(self, EventTime::Date(_))
    }

    /// The timezone the provider stated, if any.
    pub fn tzid(&self) -> Option<&str> {
        match self {
            EventTime::DateTimeZoned { tzid, .. } => Some(tzid),
            EventTime::DateTimeUtc(_) => Some("UTC"),
            _ => None,
        }
    }

    /// Absolute instant, using `anchor` for dates and floating times.
    ///
    /// Returns None when the stated timezone is unknown.
    pub fn to_utc(&self, anchor: Tz) -> Option<DateTime<Utc>> {
        match self {
            EventTime::Date(d) => resolve_local(anchor, d.and_hms_opt(0, 0, 0)?),
            EventTime::DateTimeUtc(dt) => Some(*dt),
            EventTime::DateTimeFloating(dt) => resolve_local(anchor, *dt),
            EventTime::DateTimeZoned { datetime, tzid } => {
                let tz: Tz = tzid.parse().ok()?;
                resolve_local(tz, *datetime)
            }
        }
    }
}

/// Resolve a wall-clock time in `tz`. Ambiguous times take the earlier
/// instant; times inside a DST gap move forward past the gap.
pub fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            let shifted = local + chrono::Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
        }
    }
}

/// Recurrence rule of a series master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recurrence {
    /// RRULE value without the `RRULE:` prefix, e.g. `FREQ=WEEKLY;BYDAY=MO`.
    pub rrule: String,
    pub exdates: Vec<EventTime>,
}

/// One record as reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEventRecord {
    pub provider_event_id: String,
    /// Provider etag / change key.
    pub revision: String,
    pub start: EventTime,
    pub end: EventTime,
    /// Set on series masters only.
    pub recurrence: Option<Recurrence>,
    /// Set on instances and exceptions of a series.
    pub recurring_event_id: Option<String>,
    /// Original start of an instance or exception within its series.
    pub original_start: Option<EventTime>,
    /// An occurrence the provider already expanded and addresses by its own
    /// id, rather than as an override of a master we expand ourselves.
    pub instance: bool,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub attendees: Vec<String>,
    pub status: EventStatus,
    pub transparency: Transparency,
    pub updated: Option<DateTime<Utc>>,
}

impl RawEventRecord {
    /// Minimal timed record; adapters and tests fill in the rest.
    pub fn new(id: &str, revision: &str, title: &str, start: EventTime, end: EventTime) -> Self {
        RawEventRecord {
            provider_event_id: id.to_string(),
            revision: revision.to_string(),
            start,
            end,
            recurrence: None,
            recurring_event_id: None,
            original_start: None,
            instance: false,
            title: title.to_string(),
            description: None,
            location: None,
            attendees: Vec::new(),
            status: EventStatus::Confirmed,
            transparency: Transparency::Opaque,
            updated: None,
        }
    }

    pub fn is_series_master(&self) -> bool {
        self.recurrence.is_some()
    }

    /// An exception (modified or cancelled occurrence) of a series.
    pub fn is_exception(&self) -> bool {
        !self.instance && self.recurring_event_id.is_some() && self.original_start.is_some()
    }
}

/// Result of one adapter fetch.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    pub records: Vec<RawEventRecord>,
    /// Provider ids reported deleted since the previous cursor.
    pub removed: Vec<String>,
    pub next_cursor: Option<String>,
    /// The records are the calendar's complete set (full or poll-all fetch);
    /// anything stored for the calendar but absent here is gone.
    pub complete: bool,
    /// Records skipped as malformed.
    pub skipped: usize,
    /// Ids of skipped records, where the provider gave one. A complete set
    /// does not remove these.
    pub skipped_ids: Vec<String>,
}

impl Delta {
    /// Count a malformed record, keeping its id if it had one.
    pub fn skip(&mut self, provider_event_id: Option<String>) {
        self.skipped += 1;
        self.skipped_ids.extend(provider_event_id);
    }
}
