//! Canonical, provider-agnostic event types.
//!
//! Providers report records in their own shapes (see [`crate::raw`]); the
//! normalizer turns those into [`Event`]s and the dedup resolver merges events
//! that describe the same meeting. Everything downstream works only with these
//! types.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KronosError, KronosResult};

pub type UserId = Uuid;
pub type CalendarId = Uuid;
pub type EventId = Uuid;

/// Identifies one provider record within one calendar.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub calendar_id: CalendarId,
    pub provider_event_id: String,
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.calendar_id, self.provider_event_id)
    }
}

/// Pointer from a canonical event back to one provider's record and revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub calendar_id: CalendarId,
    pub provider_event_id: String,
    /// Provider etag / change key. The only basis for change detection.
    pub revision: String,
    /// Recurring series this occurrence belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,
    /// Set for provider-reported exceptions, which override generated occurrences.
    #[serde(default)]
    pub detached: bool,
}

impl SourceRef {
    pub fn key(&self) -> SourceKey {
        SourceKey {
            calendar_id: self.calendar_id,
            provider_event_id: self.provider_event_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

/// Event transparency (busy/free status)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transparency {
    /// Event blocks time on calendar (default)
    Opaque,
    /// Event does not block time (shows as free)
    Transparent,
}

/// How certain a cross-provider merge is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeConfidence {
    Exact,
    Probable,
}

impl MergeConfidence {
    /// Confidence of a merge built from two parts: the weaker one wins.
    pub fn combine(self, other: MergeConfidence) -> MergeConfidence {
        match (self, other) {
            (MergeConfidence::Exact, MergeConfidence::Exact) => MergeConfidence::Exact,
            _ => MergeConfidence::Probable,
        }
    }
}

/// Reference to the recurring series an expanded occurrence came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceOf {
    pub series_id: String,
    /// Original (unmodified) start of this occurrence within the series.
    pub recurrence_id: DateTime<Utc>,
}

/// A canonical event: one real-world occurrence on a user's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub user_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    /// Exclusive. For all-day events this is the next local midnight.
    pub end: DateTime<Utc>,
    pub all_day: bool,
    /// Source timezone, kept for display only.
    pub timezone: Option<String>,
    pub status: EventStatus,
    pub transparency: Transparency,
    /// Lowercased attendee email addresses.
    pub attendees: BTreeSet<String>,
    /// Sorted by source key, at most one entry per key.
    pub source_refs: Vec<SourceRef>,
    /// Free-text tag owned by the invoicing collaborator.
    pub client_tag: Option<String>,
    pub occurrence_of: Option<OccurrenceOf>,
    pub merge_confidence: MergeConfidence,
    /// Provider's last-modified timestamp of the primary source.
    pub updated_at: Option<DateTime<Utc>>,
    pub tombstoned_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn is_live(&self) -> bool {
        self.tombstoned_at.is_none()
    }

    /// Whether this event occupies time on the user's timeline.
    pub fn blocks_time(&self) -> bool {
        self.is_live()
            && self.status != EventStatus::Cancelled
            && self.transparency == Transparency::Opaque
            && self.start < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// True overlap. Touching boundaries (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Event) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn source_keys(&self) -> impl Iterator<Item = SourceKey> + '_ {
        self.source_refs.iter().map(SourceRef::key)
    }

    pub fn source_ref(&self, key: &SourceKey) -> Option<&SourceRef> {
        self.source_refs.iter().find(|r| {
            r.calendar_id == key.calendar_id && r.provider_event_id == key.provider_event_id
        })
    }

    pub fn calendars(&self) -> BTreeSet<CalendarId> {
        self.source_refs.iter().map(|r| r.calendar_id).collect()
    }

    /// Insert or replace the ref with the same key, keeping the list sorted.
    pub fn upsert_source_ref(&mut self, source: SourceRef) {
        let key = source.key();
        match self.source_refs.binary_search_by(|r| r.key().cmp(&key)) {
            Ok(idx) => self.source_refs[idx] = source,
            Err(idx) => self.source_refs.insert(idx, source),
        }
    }

    pub fn remove_source_ref(&mut self, key: &SourceKey) -> Option<SourceRef> {
        let idx = self
            .source_refs
            .binary_search_by(|r| r.key().cmp(key))
            .ok()?;
        Some(self.source_refs.remove(idx))
    }

    /// Check the structural invariants every stored event must satisfy.
    pub fn validate(&self) -> KronosResult<()> {
        if self.source_refs.is_empty() {
            return Err(KronosError::Invariant(format!(
                "event {} has no source refs",
                self.id
            )));
        }
        let ordered = if self.all_day {
            self.start <= self.end
        } else {
            self.start < self.end
        };
        if !ordered {
            return Err(KronosError::Invariant(format!(
                "event {} ends ({}) before it starts ({})",
                self.id, self.end, self.start
            )));
        }
        let sorted = self
            .source_refs
            .windows(2)
            .all(|pair| pair[0].key() < pair[1].key());
        if !sorted {
            return Err(KronosError::Invariant(format!(
                "event {} has unsorted or duplicate source refs",
                self.id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all_day {
            write!(f, "{} (all day) {}", self.start.format("%Y-%m-%d"), self.title)
        } else {
            write!(
                f,
                "{} - {} {}",
                self.start.format("%Y-%m-%d %H:%M"),
                self.end.format("%H:%M"),
                self.title
            )
        }
    }
}
