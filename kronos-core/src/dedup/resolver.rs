//! Folding one calendar's normalized delta into a user's stored timeline.
//!
//! Only refs named by the delta are touched. Touched events (new, changed, or
//! having lost a ref) are compared against each other and against live events
//! starting within the merge tolerance; matches are unioned and each resulting
//! component becomes one canonical event. Everything else is left as stored.
//!
//! The outcome does not depend on record arrival order: pending records are
//! keyed by source key and edges are applied in a fixed order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::calendar::Calendar;
use crate::dedup::similarity::{MatchResult, MergeMatcher};
use crate::error::{KronosError, KronosResult};
use crate::event::{CalendarId, Event, EventId, MergeConfidence, SourceKey};
use crate::normalize::NormalizedDelta;
use crate::store::EventChanges;

#[derive(Debug, Clone, Copy)]
pub struct MergeResolver {
    matcher: MergeMatcher,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub changes: EventChanges,
    /// The user's live events after this delta.
    pub timeline: Vec<Event>,
    pub created: usize,
    pub updated: usize,
    pub tombstoned: usize,
}

/// A record from the delta awaiting merge evaluation.
struct Pending {
    key: SourceKey,
    event: Event,
    /// The stored single-ref event this record updates in place.
    replaces: Option<Event>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Pending(usize),
    Stored(EventId),
}

struct Edge {
    a: usize,
    b: usize,
    result: MatchResult,
}

/// Working copy of the user's events during one resolve.
struct Timeline {
    events: BTreeMap<EventId, Event>,
    by_key: HashMap<SourceKey, EventId>,
    touched: BTreeSet<EventId>,
    now: DateTime<Utc>,
}

impl Timeline {
    fn new(existing: &[Event], now: DateTime<Utc>) -> Self {
        let mut events = BTreeMap::new();
        let mut by_key = HashMap::new();
        for event in existing.iter().filter(|e| e.is_live()) {
            for key in event.source_keys() {
                by_key.insert(key, event.id);
            }
            events.insert(event.id, event.clone());
        }
        Timeline {
            events,
            by_key,
            touched: BTreeSet::new(),
            now,
        }
    }

    /// Drop one ref. The last ref is kept on the tombstone for history.
    fn detach(&mut self, key: &SourceKey) {
        let Some(id) = self.by_key.remove(key) else {
            return;
        };
        let Some(event) = self.events.get_mut(&id) else {
            return;
        };
        if event.source_refs.len() <= 1 {
            event.tombstoned_at = Some(self.now);
        } else {
            event.remove_source_ref(key);
            if event.source_refs.len() == 1 {
                event.merge_confidence = MergeConfidence::Exact;
            }
        }
        self.touched.insert(id);
    }

    fn put(&mut self, event: Event) {
        if event.is_live() {
            for key in event.source_keys() {
                self.by_key.insert(key, event.id);
            }
        }
        self.touched.insert(event.id);
        self.events.insert(event.id, event);
    }

    fn is_touched_live(&self, id: &EventId) -> bool {
        self.touched.contains(id) && self.events.get(id).is_some_and(Event::is_live)
    }
}

/// Disjoint-set forest carrying per-component calendars and confidence.
struct Components {
    parent: Vec<usize>,
    calendars: Vec<BTreeSet<CalendarId>>,
    confidence: Vec<MergeConfidence>,
}

impl Components {
    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Union unless both sides already hold a ref from the same calendar.
    fn union(&mut self, a: usize, b: usize, confidence: MergeConfidence) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb || !self.calendars[ra].is_disjoint(&self.calendars[rb]) {
            return;
        }
        let (keep, drop) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[drop] = keep;
        let moved = std::mem::take(&mut self.calendars[drop]);
        self.calendars[keep].extend(moved);
        self.confidence[keep] = self.confidence[keep]
            .combine(self.confidence[drop])
            .combine(confidence);
    }
}

fn node_event<'a>(pending: &'a [Pending], tl: &'a Timeline, node: Node) -> &'a Event {
    match node {
        Node::Pending(i) => &pending[i].event,
        Node::Stored(id) => &tl.events[&id],
    }
}

/// Stable identity used to order nodes independently of arrival.
fn node_key(pending: &[Pending], tl: &Timeline, node: Node) -> SourceKey {
    match node {
        Node::Pending(i) => pending[i].key.clone(),
        Node::Stored(id) => tl.events[&id].source_refs[0].key(),
    }
}

fn confidence_rank(confidence: MergeConfidence) -> u8 {
    match confidence {
        MergeConfidence::Exact => 0,
        MergeConfidence::Probable => 1,
    }
}

impl MergeResolver {
    pub fn new(matcher: MergeMatcher) -> Self {
        MergeResolver { matcher }
    }

    /// Apply `delta` from `calendar` on top of the user's `existing` events.
    pub fn resolve(
        &self,
        calendar: &Calendar,
        existing: &[Event],
        delta: NormalizedDelta,
        now: DateTime<Utc>,
    ) -> KronosResult<MergeOutcome> {
        let original: HashMap<EventId, &Event> = existing.iter().map(|e| (e.id, e)).collect();
        let mut tl = Timeline::new(existing, now);

        apply_removals(calendar, &mut tl, &delta);
        let pending = collect_pending(&mut tl, delta.events)?;
        self.merge_pending(&mut tl, pending);

        let mut outcome = MergeOutcome::default();
        for id in &tl.touched {
            let Some(event) = tl.events.get(id) else {
                continue;
            };
            match original.get(id) {
                Some(before) if *before == event => continue,
                Some(_) if !event.is_live() => outcome.tombstoned += 1,
                Some(_) => outcome.updated += 1,
                None => outcome.created += 1,
            }
            event.validate()?;
            outcome.changes.upserted.push(event.clone());
        }
        outcome.timeline = tl.events.into_values().filter(Event::is_live).collect();

        tracing::debug!(
            calendar_id = %calendar.id,
            created = outcome.created,
            updated = outcome.updated,
            tombstoned = outcome.tombstoned,
            "resolved delta"
        );

        Ok(outcome)
    }

    fn merge_pending(&self, tl: &mut Timeline, pending: Vec<Pending>) {
        let tolerance = self.matcher.tolerance();

        let mut by_start: Vec<(DateTime<Utc>, EventId)> =
            tl.events.values().filter(|e| e.is_live()).map(|e| (e.start, e.id)).collect();
        by_start.sort();

        let touched_live: Vec<EventId> =
            tl.touched.iter().copied().filter(|id| tl.is_touched_live(id)).collect();

        let mut probes: Vec<DateTime<Utc>> = pending.iter().map(|p| p.event.start).collect();
        probes.extend(touched_live.iter().map(|id| tl.events[id].start));

        // Live stored events a touched event could merge with.
        let mut stored: BTreeSet<EventId> = touched_live.into_iter().collect();
        for start in probes {
            let lo = by_start.partition_point(|(s, _)| *s < start - tolerance);
            stored.extend(
                by_start[lo..]
                    .iter()
                    .take_while(|(s, _)| *s <= start + tolerance)
                    .map(|(_, id)| *id),
            );
        }

        let mut nodes: Vec<Node> = (0..pending.len()).map(Node::Pending).collect();
        nodes.extend(stored.into_iter().map(Node::Stored));
        let keys: Vec<SourceKey> = nodes.iter().map(|n| node_key(&pending, tl, *n)).collect();
        let active: Vec<bool> = nodes
            .iter()
            .map(|n| match n {
                Node::Pending(_) => true,
                Node::Stored(id) => tl.touched.contains(id),
            })
            .collect();

        let mut order: Vec<usize> = (0..nodes.len()).collect();
        order.sort_by(|&a, &b| {
            let (ea, eb) = (node_event(&pending, tl, nodes[a]), node_event(&pending, tl, nodes[b]));
            ea.start.cmp(&eb.start).then_with(|| keys[a].cmp(&keys[b]))
        });

        let mut edges = Vec::new();
        for (pos, &a) in order.iter().enumerate() {
            let ea = node_event(&pending, tl, nodes[a]);
            for &b in &order[pos + 1..] {
                let eb = node_event(&pending, tl, nodes[b]);
                if eb.start - ea.start > tolerance {
                    break;
                }
                if !active[a] && !active[b] {
                    continue;
                }
                if let Some(result) = self.matcher.compare(ea, eb) {
                    let (a, b) = if keys[a] <= keys[b] { (a, b) } else { (b, a) };
                    edges.push(Edge { a, b, result });
                }
            }
        }
        edges.sort_by(|x, y| {
            y.result
                .score
                .total_cmp(&x.result.score)
                .then_with(|| {
                    confidence_rank(x.result.confidence).cmp(&confidence_rank(y.result.confidence))
                })
                .then_with(|| keys[x.a].cmp(&keys[y.a]))
                .then_with(|| keys[x.b].cmp(&keys[y.b]))
        });

        let mut components = Components {
            parent: (0..nodes.len()).collect(),
            calendars: nodes.iter().map(|n| node_event(&pending, tl, *n).calendars()).collect(),
            confidence: nodes
                .iter()
                .map(|n| node_event(&pending, tl, *n).merge_confidence)
                .collect(),
        };
        for edge in &edges {
            components.union(edge.a, edge.b, edge.result.confidence);
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for idx in 0..nodes.len() {
            let root = components.find(idx);
            groups.entry(root).or_default().push(idx);
        }

        let mut pending: Vec<Option<Pending>> = pending.into_iter().map(Some).collect();
        for (root, members) in groups {
            let mut parts: Vec<(SourceKey, Event)> = Vec::new();
            // Previous versions of events that could keep their id.
            let mut heirs: Vec<(SourceKey, Event)> = Vec::new();

            for idx in members {
                match nodes[idx] {
                    Node::Pending(i) => {
                        let Some(p) = pending[i].take() else { continue };
                        if let Some(old) = p.replaces {
                            heirs.push((p.key.clone(), old));
                        }
                        parts.push((p.key, p.event));
                    }
                    Node::Stored(id) => {
                        let Some(event) = tl.events.get(&id) else { continue };
                        heirs.push((keys[idx].clone(), event.clone()));
                        parts.push((keys[idx].clone(), event.clone()));
                    }
                }
            }

            // A lone stored event keeps whatever shape removal left it in.
            let lone_stored = parts.len() == 1
                && heirs.len() == 1
                && tl.events.contains_key(&heirs[0].1.id);
            if lone_stored {
                continue;
            }

            materialize(tl, parts, heirs, components.confidence[root]);
        }
    }
}

fn apply_removals(calendar: &Calendar, tl: &mut Timeline, delta: &NormalizedDelta) {
    let incoming: HashSet<&str> = delta
        .events
        .iter()
        .flat_map(|e| e.source_refs.iter())
        .map(|r| r.provider_event_id.as_str())
        .collect();
    let removed: HashSet<&str> = delta.removed.iter().map(String::as_str).collect();
    let removed_series: HashSet<&str> = delta.removed_series.iter().map(String::as_str).collect();
    let replaced_series: HashSet<&str> = delta.replaced_series.iter().map(String::as_str).collect();
    let skipped: HashSet<&str> = delta.skipped_ids.iter().map(String::as_str).collect();

    let mut doomed: Vec<SourceKey> = tl
        .by_key
        .iter()
        .filter(|(key, _)| key.calendar_id == calendar.id)
        .filter_map(|(key, id)| {
            let source = tl.events.get(id)?.source_ref(key)?;
            let pid = source.provider_event_id.as_str();
            if incoming.contains(pid) {
                return None;
            }
            let series = source.series_id.as_deref();
            // A malformed record is still present at the provider.
            let held = skipped.contains(pid) || series.is_some_and(|s| skipped.contains(s));
            let gone = (delta.complete && !held)
                || removed.contains(pid)
                || series.is_some_and(|s| removed_series.contains(s))
                || (!held && !source.detached && series.is_some_and(|s| replaced_series.contains(s)));
            gone.then(|| key.clone())
        })
        .collect();
    doomed.sort();

    for key in &doomed {
        tl.detach(key);
    }
}

fn collect_pending(tl: &mut Timeline, events: Vec<Event>) -> KronosResult<Vec<Pending>> {
    let mut pending: BTreeMap<SourceKey, Pending> = BTreeMap::new();

    for event in events {
        let incoming = match event.source_refs.as_slice() {
            [only] => only.clone(),
            _ => {
                return Err(KronosError::Invariant(format!(
                    "pre-merge event {} must carry exactly one source ref",
                    event.id
                )));
            }
        };
        let key = incoming.key();

        let mut replaces = None;
        if let Some(&id) = tl.by_key.get(&key) {
            let Some(current) = tl.events.get(&id).and_then(|e| e.source_ref(&key)) else {
                continue;
            };
            // A stored exception stays authoritative over a regenerated occurrence.
            if current.detached && !incoming.detached {
                continue;
            }
            if current.revision == incoming.revision && current.detached == incoming.detached {
                continue;
            }
            tl.by_key.remove(&key);
            let single = tl.events.get(&id).is_some_and(|e| e.source_refs.len() == 1);
            if single {
                replaces = tl.events.remove(&id);
            } else if let Some(stored) = tl.events.get_mut(&id) {
                stored.remove_source_ref(&key);
                if stored.source_refs.len() == 1 {
                    stored.merge_confidence = MergeConfidence::Exact;
                }
                tl.touched.insert(id);
            }
        }

        match pending.get_mut(&key) {
            // Same record twice in one delta: keep the newer one.
            Some(existing) => {
                let newer = (event.updated_at, &incoming.revision)
                    > (existing.event.updated_at, &existing.event.source_refs[0].revision);
                if newer {
                    existing.event = event;
                }
            }
            None => {
                pending.insert(
                    key.clone(),
                    Pending {
                        key,
                        event,
                        replaces,
                    },
                );
            }
        }
    }

    Ok(pending.into_values().collect())
}

/// Fold one merge component into a single canonical event.
///
/// The id survives from the member with the smallest source key among those
/// already stored. Other stored members are tombstoned.
fn materialize(
    tl: &mut Timeline,
    mut parts: Vec<(SourceKey, Event)>,
    mut heirs: Vec<(SourceKey, Event)>,
    confidence: MergeConfidence,
) {
    parts.sort_by(|a, b| a.0.cmp(&b.0));
    heirs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut members = parts.into_iter().map(|(_, e)| e);
    let Some(mut merged) = members.next() else {
        return;
    };
    let survivor = heirs.first().map_or(merged.id, |(_, e)| e.id);

    for other in members {
        for source in other.source_refs {
            merged.upsert_source_ref(source);
        }
        merged.attendees.extend(other.attendees);
        merged.description = merged.description.or(other.description);
        merged.location = merged.location.or(other.location);
        merged.occurrence_of = merged.occurrence_of.or(other.occurrence_of);
        merged.updated_at = merged.updated_at.max(other.updated_at);
    }

    merged.client_tag = heirs
        .iter()
        .find(|(_, e)| e.id == survivor)
        .and_then(|(_, e)| e.client_tag.clone())
        .or_else(|| heirs.iter().find_map(|(_, e)| e.client_tag.clone()));
    merged.id = survivor;
    merged.tombstoned_at = None;
    merged.merge_confidence = if merged.source_refs.len() == 1 {
        MergeConfidence::Exact
    } else {
        confidence
    };

    for (_, mut previous) in heirs {
        if previous.id == survivor {
            continue;
        }
        for key in previous.source_keys().collect::<Vec<_>>() {
            if tl.by_key.get(&key) == Some(&previous.id) {
                tl.by_key.remove(&key);
            }
        }
        previous.tombstoned_at = Some(tl.now);
        tl.put(previous);
    }

    tl.put(merged);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ProviderKind;
    use crate::event::SourceRef;
    use crate::event::test_support::*;
    use chrono::Duration;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use uuid::Uuid;

    const USER: Uuid = Uuid::from_u128(7);

    fn resolver() -> MergeResolver {
        MergeResolver::new(MergeMatcher::new(Duration::seconds(60), 0.75))
    }

    fn calendar(n: u128, provider: ProviderKind) -> Calendar {
        Calendar::new(Uuid::from_u128(n), USER, provider, "me@example.com", "UTC")
    }

    fn record(
        cal: &Calendar,
        id: &str,
        rev: &str,
        title: &str,
        start: (u32, u32),
        end: (u32, u32),
    ) -> Event {
        let mut e = event(title, at(start.0, start.1), at(end.0, end.1));
        e.user_id = USER;
        e.source_refs = vec![source(cal.id, id, rev)];
        e
    }

    fn delta(events: Vec<Event>) -> NormalizedDelta {
        NormalizedDelta {
            events,
            ..Default::default()
        }
    }

    fn apply(existing: &[Event], cal: &Calendar, d: NormalizedDelta) -> MergeOutcome {
        resolver().resolve(cal, existing, d, at(0, 0)).unwrap()
    }

    /// Stored table after applying an outcome's changes on top of `existing`.
    fn fold(existing: &[Event], outcome: &MergeOutcome) -> Vec<Event> {
        let mut table: BTreeMap<EventId, Event> =
            existing.iter().map(|e| (e.id, e.clone())).collect();
        for e in &outcome.changes.upserted {
            table.insert(e.id, e.clone());
        }
        table.into_values().collect()
    }

    fn live(table: &[Event]) -> Vec<&Event> {
        table.iter().filter(|e| e.is_live()).collect()
    }

    #[test]
    fn test_same_meeting_from_two_providers_merges_exact() {
        let google = calendar(1, ProviderKind::GoogleCalendar);
        let outlook = calendar(2, ProviderKind::MicrosoftCalendar);

        let first = apply(
            &[],
            &google,
            delta(vec![record(&google, "g1", "1", "Sync Review", (10, 0), (11, 0))]),
        );
        assert_eq!(first.created, 1);
        let table = fold(&[], &first);

        let second = apply(
            &table,
            &outlook,
            delta(vec![record(&outlook, "o1", "a", "Sync Review", (10, 0), (11, 0))]),
        );
        let table = fold(&table, &second);
        let live = live(&table);

        assert_eq!(live.len(), 1);
        assert_eq!(live[0].source_refs.len(), 2);
        assert_eq!(live[0].merge_confidence, MergeConfidence::Exact);
        assert_eq!(live[0].id, first.changes.upserted[0].id);
        assert_eq!(second.timeline.len(), 1);
    }

    #[test]
    fn test_reapplying_delta_changes_nothing() {
        let google = calendar(1, ProviderKind::GoogleCalendar);
        let d = delta(vec![
            record(&google, "g1", "1", "Standup", (9, 0), (9, 15)),
            record(&google, "g2", "1", "Lunch", (12, 0), (13, 0)),
        ]);

        let first = apply(&[], &google, d.clone());
        let table = fold(&[], &first);
        let again = apply(&table, &google, d);

        assert!(again.changes.is_empty());
        assert_eq!(again.timeline.len(), 2);
    }

    #[test]
    fn test_arrival_order_does_not_change_result() {
        let a = calendar(1, ProviderKind::GoogleCalendar);
        let b = calendar(2, ProviderKind::MicrosoftCalendar);
        let c = calendar(3, ProviderKind::CalDotCom);

        let seed_a = delta(vec![record(&a, "a1", "1", "Design sync", (14, 0), (15, 0))]);
        let table = fold(&[], &apply(&[], &a, seed_a));
        let seed_b = delta(vec![record(&b, "b1", "1", "Design sync", (14, 0), (15, 0))]);
        let table = fold(&table, &apply(&table, &b, seed_b));

        let incoming = vec![
            record(&c, "c1", "1", "Design sync", (14, 0), (15, 0)),
            record(&c, "c2", "1", "Retro", (16, 0), (17, 0)),
            record(&c, "c3", "1", "1:1", (17, 0), (17, 30)),
        ];

        let shape = |events: &[Event]| -> Vec<(String, Vec<SourceKey>)> {
            let mut v: Vec<_> = events
                .iter()
                .map(|e| (e.title.clone(), e.source_keys().collect()))
                .collect();
            v.sort();
            v
        };

        let expected = shape(&apply(&table, &c, delta(incoming.clone())).timeline);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..8 {
            let mut shuffled = incoming.clone();
            shuffled.shuffle(&mut rng);
            let outcome = apply(&table, &c, delta(shuffled));
            assert_eq!(shape(&outcome.timeline), expected);
        }
        assert_eq!(expected.len(), 3);
    }

    #[test]
    fn test_transitive_match_across_three_calendars() {
        let a = calendar(1, ProviderKind::GoogleCalendar);
        let b = calendar(2, ProviderKind::MicrosoftCalendar);
        let c = calendar(3, ProviderKind::CalDotCom);

        let mut table = Vec::new();
        for (cal, id) in [(&a, "a1"), (&b, "b1"), (&c, "c1")] {
            let d = delta(vec![record(cal, id, "1", "Planning", (10, 0), (11, 0))]);
            let outcome = apply(&table, cal, d);
            table = fold(&table, &outcome);
        }

        let live = live(&table);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].calendars().len(), 3);
    }

    #[test]
    fn test_removing_one_provider_keeps_other_ref() {
        let google = calendar(1, ProviderKind::GoogleCalendar);
        let outlook = calendar(2, ProviderKind::MicrosoftCalendar);

        let d = delta(vec![record(&google, "g1", "1", "Sync Review", (10, 0), (11, 0))]);
        let table = fold(&[], &apply(&[], &google, d));
        let d = delta(vec![record(&outlook, "o1", "1", "Sync Review", (10, 0), (11, 0))]);
        let table = fold(&table, &apply(&table, &outlook, d));
        let merged_id = live(&table)[0].id;

        let removal = NormalizedDelta {
            removed: vec!["o1".to_string()],
            ..Default::default()
        };
        let outcome = apply(&table, &outlook, removal);
        let table = fold(&table, &outcome);
        let live = live(&table);

        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, merged_id);
        assert_eq!(live[0].source_refs.len(), 1);
        assert_eq!(live[0].source_refs[0].calendar_id, google.id);
        assert_eq!(live[0].merge_confidence, MergeConfidence::Exact);
    }

    #[test]
    fn test_last_ref_removal_tombstones() {
        let google = calendar(1, ProviderKind::GoogleCalendar);
        let d = delta(vec![record(&google, "g1", "1", "Gym", (7, 0), (8, 0))]);
        let table = fold(&[], &apply(&[], &google, d));

        let outcome = apply(
            &table,
            &google,
            NormalizedDelta {
                removed: vec!["g1".to_string()],
                ..Default::default()
            },
        );
        assert_eq!(outcome.tombstoned, 1);
        assert!(outcome.timeline.is_empty());
        let gone = &outcome.changes.upserted[0];
        assert_eq!(gone.tombstoned_at, Some(at(0, 0)));
        assert_eq!(gone.source_refs.len(), 1);
    }

    #[test]
    fn test_revision_change_updates_in_place() {
        let google = calendar(1, ProviderKind::GoogleCalendar);
        let d = delta(vec![record(&google, "g1", "1", "Review", (10, 0), (11, 0))]);
        let mut table = fold(&[], &apply(&[], &google, d));
        table[0].client_tag = Some("crm-42".into());

        let d = delta(vec![record(&google, "g1", "2", "Review (moved)", (13, 0), (14, 0))]);
        let outcome = apply(&table, &google, d);
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.created, 0);
        let updated = &outcome.changes.upserted[0];
        assert_eq!(updated.id, table[0].id);
        assert_eq!(updated.start, at(13, 0));
        assert_eq!(updated.client_tag.as_deref(), Some("crm-42"));
    }

    #[test]
    fn test_complete_delta_removes_unlisted_refs() {
        let cal = calendar(3, ProviderKind::CalDotCom);
        let d = delta(vec![
            record(&cal, "b1", "1", "Intro call", (9, 0), (9, 30)),
            record(&cal, "b2", "1", "Demo", (11, 0), (12, 0)),
        ]);
        let table = fold(&[], &apply(&[], &cal, d));

        let mut full = delta(vec![record(&cal, "b2", "1", "Demo", (11, 0), (12, 0))]);
        full.complete = true;
        let outcome = apply(&table, &cal, full);

        assert_eq!(outcome.tombstoned, 1);
        assert_eq!(outcome.timeline.len(), 1);
        assert_eq!(outcome.timeline[0].title, "Demo");
    }

    #[test]
    fn test_complete_delta_keeps_skipped_records() {
        let cal = calendar(1, ProviderKind::GoogleCalendar);
        let mut occurrence = record(&cal, "s_20250320T090000Z", "1", "Standup", (9, 0), (9, 15));
        occurrence.source_refs[0].series_id = Some("s".into());
        let d = delta(vec![
            record(&cal, "a", "1", "Planning", (10, 0), (11, 0)),
            record(&cal, "b", "1", "Interview", (10, 30), (11, 30)),
            occurrence,
        ]);
        let table = fold(&[], &apply(&[], &cal, d));

        // Both "a" and the series master came back malformed.
        let mut full = delta(vec![record(&cal, "b", "1", "Interview", (10, 30), (11, 30))]);
        full.complete = true;
        full.skipped_ids = vec!["a".into(), "s".into()];
        let outcome = apply(&table, &cal, full);

        assert_eq!(outcome.tombstoned, 0);
        assert!(outcome.changes.is_empty());
        assert_eq!(outcome.timeline.len(), 3);
    }

    #[test]
    fn test_stale_generated_occurrences_dropped_but_exceptions_kept() {
        let google = calendar(1, ProviderKind::GoogleCalendar);
        let mut generated = record(&google, "s_20250320T090000Z", "1", "Standup", (9, 0), (9, 15));
        generated.source_refs[0].series_id = Some("s".into());
        let mut moved = record(&google, "s_20250320T100000Z", "1", "Standup", (10, 30), (10, 45));
        moved.source_refs[0] = SourceRef {
            series_id: Some("s".into()),
            detached: true,
            ..moved.source_refs[0].clone()
        };
        let table = fold(&[], &apply(&[], &google, delta(vec![generated, moved])));

        let replaced = NormalizedDelta {
            replaced_series: vec!["s".into()],
            ..Default::default()
        };
        let outcome = apply(&table, &google, replaced);

        assert_eq!(outcome.timeline.len(), 1);
        assert!(outcome.timeline[0].source_refs[0].detached);
    }

    #[test]
    fn test_multi_ref_pre_merge_event_rejected() {
        let google = calendar(1, ProviderKind::GoogleCalendar);
        let mut bad = record(&google, "g1", "1", "X", (9, 0), (10, 0));
        bad.source_refs.push(source(Uuid::from_u128(2), "o1", "1"));
        let err = resolver().resolve(&google, &[], delta(vec![bad]), at(0, 0));
        assert!(matches!(err, Err(KronosError::Invariant(_))));
    }
}
