//! Similarity scoring between two canonical events.

use std::collections::BTreeSet;

use chrono::Duration;

use crate::event::{Event, MergeConfidence};

/// Decides whether two events describe the same meeting.
#[derive(Debug, Clone, Copy)]
pub struct MergeMatcher {
    tolerance: Duration,
    threshold: f64,
}

/// A positive match between two events.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub confidence: MergeConfidence,
    pub score: f64,
}

impl MergeMatcher {
    pub fn new(tolerance: Duration, threshold: f64) -> Self {
        MergeMatcher {
            tolerance,
            threshold,
        }
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Compare two events. None means they stay distinct.
    ///
    /// Events sharing a calendar never match: one provider never reports the
    /// same meeting twice in one calendar, so concurrent entries there are
    /// genuine double bookings.
    pub fn compare(&self, a: &Event, b: &Event) -> Option<MatchResult> {
        if a.all_day != b.all_day {
            return None;
        }
        if !a.calendars().is_disjoint(&b.calendars()) {
            return None;
        }
        let start_skew = (a.start - b.start).abs();
        let end_skew = (a.end - b.end).abs();
        if start_skew > self.tolerance || end_skew > self.tolerance {
            return None;
        }

        let title = title_similarity(&a.title, &b.title);
        let score = match attendee_overlap(&a.attendees, &b.attendees) {
            Some(overlap) => (title + overlap) / 2.0,
            None => title,
        };
        if score < self.threshold {
            return None;
        }

        let identical_interval = a.start == b.start && a.end == b.end;
        let nested_attendees =
            a.attendees.is_subset(&b.attendees) || b.attendees.is_subset(&a.attendees);
        let confidence = if identical_interval && nested_attendees {
            MergeConfidence::Exact
        } else {
            MergeConfidence::Probable
        };

        Some(MatchResult { confidence, score })
    }
}

/// Lowercase, strip punctuation and collapse whitespace.
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Jaccard similarity of the normalized title token sets.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_title(a);
    let b = normalize_title(b);
    if a == b {
        return 1.0;
    }
    let ta: BTreeSet<&str> = a.split(' ').filter(|t| !t.is_empty()).collect();
    let tb: BTreeSet<&str> = b.split(' ').filter(|t| !t.is_empty()).collect();
    jaccard(&ta, &tb)
}

/// Jaccard overlap of attendee sets. None when either side lists nobody,
/// which says nothing either way.
pub fn attendee_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    Some(jaccard(a, b))
}

fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
