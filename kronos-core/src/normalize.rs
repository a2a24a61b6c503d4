//! Event normalization: provider records to canonical, pre-merge events.
//!
//! All instants are converted to UTC here. Recurring series are expanded into
//! concrete occurrences inside the configured window, and provider-reported
//! exceptions replace the generated occurrence they override.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use uuid::Uuid;

use crate::calendar::Calendar;
use crate::date_range::DateRange;
use crate::error::KronosResult;
use crate::event::{Event, EventStatus, MergeConfidence, OccurrenceOf, SourceRef};
use crate::raw::{EventTime, RawEventRecord};
use crate::recurrence::expand_series;

/// Provider id of one occurrence of a series, e.g. `abc123_20250113T100000Z`.
pub fn occurrence_key(series_id: &str, recurrence_id: DateTime<Utc>) -> String {
    format!("{}_{}", series_id, recurrence_id.format("%Y%m%dT%H%M%SZ"))
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    window: DateRange,
    max_occurrences: u16,
}

/// Everything one calendar's delta means for the canonical timeline.
#[derive(Debug, Clone, Default)]
pub struct NormalizedDelta {
    /// Pre-merge events, each with exactly one source ref.
    pub events: Vec<Event>,
    /// Provider ids (including occurrence keys) that no longer exist.
    pub removed: Vec<String>,
    /// Series re-expanded in this delta; their stored generated occurrences
    /// missing from `events` are stale.
    pub replaced_series: Vec<String>,
    /// Series deleted outright, exceptions included.
    pub removed_series: Vec<String>,
    /// The delta is the calendar's complete set.
    pub complete: bool,
    pub skipped: usize,
    /// Provider ids and series ids of skipped records. Their stored events
    /// survive a complete set.
    pub skipped_ids: Vec<String>,
}

/// Series context for an expanded occurrence or exception.
struct Occurrence<'a> {
    series_id: &'a str,
    recurrence_id: DateTime<Utc>,
    detached: bool,
}

impl Normalizer {
    pub fn new(window: DateRange, max_occurrences: u16) -> Self {
        Normalizer {
            window,
            max_occurrences,
        }
    }

    pub fn window(&self) -> &DateRange {
        &self.window
    }

    pub fn normalize(
        &self,
        calendar: &Calendar,
        records: Vec<RawEventRecord>,
        removed: Vec<String>,
        complete: bool,
    ) -> KronosResult<NormalizedDelta> {
        let anchor = calendar.tz()?;
        // A removed id may name a series master; its occurrences go with it.
        let mut out = NormalizedDelta {
            removed_series: removed.clone(),
            removed,
            complete,
            ..Default::default()
        };

        let mut masters = Vec::new();
        let mut exceptions: HashMap<(String, DateTime<Utc>), RawEventRecord> = HashMap::new();

        for record in records {
            if record.instance {
                if record.status == EventStatus::Cancelled {
                    out.removed.push(record.provider_event_id);
                } else {
                    self.push_single(calendar, anchor, &record, &mut out);
                }
            } else if record.is_exception() {
                let series = record.recurring_event_id.clone().unwrap_or_default();
                let rid = record
                    .original_start
                    .as_ref()
                    .and_then(|t| t.to_utc(anchor));
                match rid {
                    Some(rid) => {
                        exceptions.insert((series, rid), record);
                    }
                    None => self.skip(calendar, &record, "unresolvable original start", &mut out),
                }
            } else if record.status == EventStatus::Cancelled {
                // Deletion payloads are sparse, so any cancelled id may be a series.
                out.removed_series.push(record.provider_event_id.clone());
                out.removed.push(record.provider_event_id);
            } else if record.is_series_master() {
                masters.push(record);
            } else {
                self.push_single(calendar, anchor, &record, &mut out);
            }
        }

        for master in &masters {
            self.expand_master(calendar, anchor, master, &exceptions, &mut out);
        }

        for ((series_id, rid), record) in &exceptions {
            let key = occurrence_key(series_id, *rid);
            if record.status == EventStatus::Cancelled {
                out.removed.push(key);
                continue;
            }
            let occurrence = Occurrence {
                series_id,
                recurrence_id: *rid,
                detached: true,
            };
            let in_window = self.window.contains(*rid)
                || match (record.start.to_utc(anchor), record.end.to_utc(anchor)) {
                    (Some(s), Some(e)) => self.window.intersects(s, e),
                    _ => true,
                };
            if !in_window {
                continue;
            }
            match self.build_event(calendar, anchor, record, &record.start, &record.end, key.clone(), Some(occurrence)) {
                Ok(Some(event)) => out.events.push(event),
                Ok(None) => {}
                Err(reason) => {
                    self.skip(calendar, record, &reason, &mut out);
                    out.skipped_ids.push(key);
                }
            }
        }

        tracing::debug!(
            calendar_id = %calendar.id,
            events = out.events.len(),
            removed = out.removed.len(),
            skipped = out.skipped,
            "normalized delta"
        );

        Ok(out)
    }

    fn push_single(
        &self,
        calendar: &Calendar,
        anchor: Tz,
        record: &RawEventRecord,
        out: &mut NormalizedDelta,
    ) {
        let key = record.provider_event_id.clone();
        let recurrence_id = record.original_start.as_ref().and_then(|t| t.to_utc(anchor));
        let occurrence = match (record.recurring_event_id.as_deref(), recurrence_id) {
            (Some(series_id), Some(recurrence_id)) => Some(Occurrence {
                series_id,
                recurrence_id,
                detached: false,
            }),
            _ => None,
        };
        match self.build_event(calendar, anchor, record, &record.start, &record.end, key, occurrence) {
            Ok(Some(event)) => out.events.push(event),
            Ok(None) => out.removed.push(record.provider_event_id.clone()),
            Err(reason) => self.skip(calendar, record, &reason, out),
        }
    }

    fn expand_master(
        &self,
        calendar: &Calendar,
        anchor: Tz,
        master: &RawEventRecord,
        exceptions: &HashMap<(String, DateTime<Utc>), RawEventRecord>,
        out: &mut NormalizedDelta,
    ) {
        let Some(recurrence) = master.recurrence.as_ref() else {
            return;
        };
        let series_id = master.provider_event_id.as_str();

        let occurrences = match expand_series(
            &master.start,
            &master.end,
            recurrence,
            &self.window,
            anchor,
            self.max_occurrences,
        ) {
            Ok(occurrences) => occurrences,
            Err(reason) => {
                self.skip(calendar, master, &reason, out);
                return;
            }
        };

        out.replaced_series.push(series_id.to_string());

        for occ in occurrences {
            if exceptions.contains_key(&(series_id.to_string(), occ.recurrence_id)) {
                continue;
            }
            let key = occurrence_key(series_id, occ.recurrence_id);
            let occurrence = Occurrence {
                series_id,
                recurrence_id: occ.recurrence_id,
                detached: false,
            };
            match self.build_event(calendar, anchor, master, &occ.start, &occ.end, key, Some(occurrence)) {
                Ok(Some(event)) => out.events.push(event),
                Ok(None) => {}
                Err(reason) => {
                    self.skip(calendar, master, &reason, out);
                    return;
                }
            }
        }
    }

    /// Build the pre-merge event. `Ok(None)` means the record occupies no time.
    #[allow(clippy::too_many_arguments)]
    fn build_event(
        &self,
        calendar: &Calendar,
        anchor: Tz,
        record: &RawEventRecord,
        start: &EventTime,
        end: &EventTime,
        provider_event_id: String,
        occurrence: Option<Occurrence<'_>>,
    ) -> Result<Option<Event>, String> {
        let all_day = start.is_date();
        let start_utc = start
            .to_utc(anchor)
            .ok_or_else(|| format!("unresolvable start {start:?}"))?;
        let mut end_utc = end
            .to_utc(anchor)
            .ok_or_else(|| format!("unresolvable end {end:?}"))?;

        if all_day && end_utc <= start_utc {
            // Single-day all-day events sometimes arrive with end == start.
            let next_day = match start {
                EventTime::Date(d) => EventTime::Date(*d + Duration::days(1)),
                other => other.clone(),
            };
            end_utc = next_day
                .to_utc(anchor)
                .ok_or_else(|| "unresolvable all-day end".to_string())?;
        }

        if end_utc < start_utc {
            return Err(format!("end {end_utc} before start {start_utc}"));
        }
        if end_utc == start_utc {
            tracing::debug!(
                calendar_id = %calendar.id,
                provider_event_id = %provider_event_id,
                "dropping zero-length event"
            );
            return Ok(None);
        }

        let title = record.title.trim();
        let attendees: BTreeSet<String> = record
            .attendees
            .iter()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect();

        let (series_id, detached, occurrence_of) = match occurrence {
            Some(occ) => (
                Some(occ.series_id.to_string()),
                occ.detached,
                Some(OccurrenceOf {
                    series_id: occ.series_id.to_string(),
                    recurrence_id: occ.recurrence_id,
                }),
            ),
            None => (None, false, None),
        };

        Ok(Some(Event {
            id: Uuid::new_v4(),
            user_id: calendar.user_id,
            title: if title.is_empty() {
                "(no title)".to_string()
            } else {
                title.to_string()
            },
            description: record.description.clone(),
            location: record.location.clone(),
            start: start_utc,
            end: end_utc,
            all_day,
            timezone: Some(
                start
                    .tzid()
                    .map(str::to_string)
                    .unwrap_or_else(|| calendar.timezone.clone()),
            ),
            status: record.status,
            transparency: record.transparency,
            attendees,
            source_refs: vec![SourceRef {
                calendar_id: calendar.id,
                provider_event_id,
                revision: record.revision.clone(),
                series_id,
                detached,
            }],
            client_tag: None,
            occurrence_of,
            merge_confidence: MergeConfidence::Exact,
            updated_at: record.updated,
            tombstoned_at: None,
        }))
    }

    fn skip(
        &self,
        calendar: &Calendar,
        record: &RawEventRecord,
        reason: &str,
        out: &mut NormalizedDelta,
    ) {
        tracing::warn!(
            calendar_id = %calendar.id,
            provider_event_id = %record.provider_event_id,
            "skipping malformed record: {}",
            reason
        );
        out.skipped += 1;
        out.skipped_ids.push(record.provider_event_id.clone());
    }
}
