//! Overlap detection over a user's live timeline.
//!
//! A [`ConflictGroup`] is a maximal set of events that are all busy at one
//! shared instant. Groups that chain through common members share a
//! `cluster` id.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{Event, EventId, UserId};

/// Namespace for deterministic group ids.
const CONFLICT_NAMESPACE: Uuid = Uuid::from_u128(0x6b72_6f6e_6f73_2d63_6f6e_666c_6963_7473);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Graded by the longest pairwise overlap.
    pub fn from_minutes(minutes: i64) -> Self {
        match minutes {
            m if m < 15 => Severity::Low,
            m if m < 60 => Severity::Medium,
            _ => Severity::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlapPair {
    pub a: EventId,
    pub b: EventId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictGroup {
    pub id: Uuid,
    pub user_id: UserId,
    /// Ordered by start, then id.
    pub event_ids: Vec<EventId>,
    /// The interval during which every member is busy.
    pub overlap_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub overlaps: Vec<OverlapPair>,
    pub severity: Severity,
    pub cluster: Uuid,
}

impl ConflictGroup {
    pub fn contains(&self, event_id: &EventId) -> bool {
        self.event_ids.contains(event_id)
    }
}

struct Clusters {
    parent: Vec<usize>,
}

impl Clusters {
    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        self.parent[x] = root;
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

fn group_id(members: &[EventId]) -> Uuid {
    let mut sorted = members.to_vec();
    sorted.sort();
    let mut bytes = Vec::with_capacity(sorted.len() * 16);
    for id in &sorted {
        bytes.extend_from_slice(id.as_bytes());
    }
    Uuid::new_v5(&CONFLICT_NAMESPACE, &bytes)
}

/// Find every conflict group among `events`.
///
/// Only time-blocking events participate. Intervals are half-open, so an
/// event ending exactly when another starts is not a conflict.
pub fn detect_conflicts(user_id: UserId, events: &[Event]) -> Vec<ConflictGroup> {
    let mut busy: Vec<&Event> = events.iter().filter(|e| e.blocks_time()).collect();
    busy.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));

    let mut clusters = Clusters {
        parent: (0..busy.len()).collect(),
    };
    let mut cliques: Vec<Vec<usize>> = Vec::new();
    let mut open: BinaryHeap<Reverse<(DateTime<Utc>, usize)>> = BinaryHeap::new();
    let mut grew = false;

    for (idx, event) in busy.iter().enumerate() {
        while let Some(Reverse((end, _))) = open.peek() {
            if *end > event.start {
                break;
            }
            // The open set only shrinks from here; snapshot it if it grew.
            if grew && open.len() >= 2 {
                cliques.push(open.iter().map(|Reverse((_, i))| *i).collect());
            }
            grew = false;
            open.pop();
        }
        for Reverse((_, other)) in open.iter() {
            clusters.union(*other, idx);
        }
        open.push(Reverse((event.end, idx)));
        grew = true;
    }
    if grew && open.len() >= 2 {
        cliques.push(open.iter().map(|Reverse((_, i))| *i).collect());
    }

    let mut cluster_ids: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for idx in 0..busy.len() {
        let root = clusters.find(idx);
        cluster_ids.entry(root).or_default().push(idx);
    }
    let cluster_of: BTreeMap<usize, Uuid> = cluster_ids
        .values()
        .flat_map(|members| {
            let ids: Vec<EventId> = members.iter().map(|i| busy[*i].id).collect();
            let cluster = group_id(&ids);
            members.iter().map(move |i| (*i, cluster)).collect::<Vec<_>>()
        })
        .collect();

    let mut groups: Vec<ConflictGroup> = cliques
        .into_iter()
        .map(|mut members| {
            members.sort();
            build_group(user_id, &busy, &members, cluster_of[&members[0]])
        })
        .collect();
    groups.sort_by(|a, b| {
        a.overlap_window
            .cmp(&b.overlap_window)
            .then_with(|| a.event_ids.cmp(&b.event_ids))
    });

    tracing::debug!(%user_id, events = busy.len(), groups = groups.len(), "detected conflicts");

    groups
}

fn build_group(user_id: UserId, busy: &[&Event], members: &[usize], cluster: Uuid) -> ConflictGroup {
    let event_ids: Vec<EventId> = members.iter().map(|i| busy[*i].id).collect();

    let mut overlaps = Vec::new();
    for (pos, &i) in members.iter().enumerate() {
        for &j in &members[pos + 1..] {
            let (a, b) = (busy[i], busy[j]);
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            overlaps.push(OverlapPair {
                a: a.id,
                b: b.id,
                start,
                end,
                minutes: (end - start).num_minutes(),
            });
        }
    }

    let window_start = members.iter().map(|i| busy[*i].start).max();
    let window_end = members.iter().map(|i| busy[*i].end).min();
    let overlap_window = window_start.zip(window_end).filter(|(s, e)| s < e);
    let longest = overlaps.iter().map(|o| o.minutes).max().unwrap_or(0);

    ConflictGroup {
        id: group_id(&event_ids),
        user_id,
        event_ids,
        overlap_window,
        overlaps,
        severity: Severity::from_minutes(longest),
        cluster,
    }
}
