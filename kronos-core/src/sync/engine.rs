//! Sync orchestration: the pass queue, the periodic scheduler and the
//! operations exposed to the API layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{Backoff, BusyBlockReport, PassOutcome, SyncPhase, UserLocks};
use crate::calendar::{Calendar, CalendarHealth, CalendarSummary};
use crate::config::EngineConfig;
use crate::conflict::ConflictGroup;
use crate::date_range::DateRange;
use crate::dedup::{MergeMatcher, MergeResolver};
use crate::error::{KronosError, KronosResult};
use crate::event::{CalendarId, Event, EventId, UserId};
use crate::provider::{AdapterRegistry, BusyBlock};
use crate::store::{CredentialSource, Store};

const QUEUE_CAPACITY: usize = 1024;

/// State shared by every pass.
pub(crate) struct EngineCore {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) credentials: Arc<dyn CredentialSource>,
    pub(crate) adapters: AdapterRegistry,
    pub(crate) config: EngineConfig,
    pub(crate) locks: UserLocks,
    pub(crate) backoff: Backoff,
    pub(crate) resolver: MergeResolver,
    phases: DashMap<CalendarId, SyncPhase>,
    in_flight: DashSet<CalendarId>,
    /// Calendars triggered while their pass was in flight; each gets one more pass.
    dirty: DashSet<CalendarId>,
    /// Busy blocks last written per calendar, by block id.
    pub(crate) busy_blocks: DashMap<CalendarId, HashMap<String, BusyBlock>>,
}

impl EngineCore {
    pub(crate) fn set_phase(&self, calendar_id: CalendarId, next: SyncPhase) {
        let mut phase = self.phases.entry(calendar_id).or_default();
        if !phase.can_transition_to(next) {
            tracing::warn!(calendar_id = %calendar_id, from = %*phase, to = %next, "unexpected phase transition");
        }
        *phase = next;
        tracing::debug!(calendar_id = %calendar_id, phase = %next, "phase");
    }
}

/// Removes a calendar from the in-flight set when its pass ends, however it ends.
struct InFlight {
    core: Arc<EngineCore>,
    calendar_id: CalendarId,
}

impl InFlight {
    fn claim(core: &Arc<EngineCore>, calendar_id: CalendarId) -> Option<Self> {
        core.in_flight.insert(calendar_id).then(|| InFlight {
            core: Arc::clone(core),
            calendar_id,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.core.in_flight.remove(&self.calendar_id);
    }
}

/// Per-user overview for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub user_id: UserId,
    pub calendars_active: usize,
    pub calendars_degraded: usize,
    pub calendars_deactivated: usize,
    pub live_events: usize,
    pub conflict_groups: usize,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub passes_in_flight: usize,
}

/// Background tasks started by [`SyncEngine::start`].
pub struct EngineTasks {
    pub dispatcher: JoinHandle<()>,
    pub scheduler: JoinHandle<()>,
}

impl EngineTasks {
    pub fn abort(&self) {
        self.dispatcher.abort();
        self.scheduler.abort();
    }
}

pub struct SyncEngine {
    core: Arc<EngineCore>,
    queue: mpsc::Sender<CalendarId>,
    receiver: Mutex<Option<mpsc::Receiver<CalendarId>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn Store>,
        credentials: Arc<dyn CredentialSource>,
        adapters: AdapterRegistry,
        config: EngineConfig,
    ) -> Self {
        let matcher = MergeMatcher::new(config.merge_tolerance(), config.merge.threshold);
        let core = EngineCore {
            store,
            credentials,
            adapters,
            locks: UserLocks::new(),
            backoff: Backoff::new(config.sync.backoff_base, config.sync.backoff_cap),
            resolver: MergeResolver::new(matcher),
            phases: DashMap::new(),
            in_flight: DashSet::new(),
            dirty: DashSet::new(),
            busy_blocks: DashMap::new(),
            config,
        };
        let (queue, receiver) = mpsc::channel(QUEUE_CAPACITY);

        SyncEngine {
            core: Arc::new(core),
            queue,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Spawn the dispatcher and the periodic scheduler. Call once, inside a
    /// tokio runtime.
    pub fn start(&self) -> KronosResult<EngineTasks> {
        let receiver = self
            .receiver
            .lock()
            .map_err(|_| KronosError::Invariant("engine receiver lock poisoned".into()))?
            .take()
            .ok_or_else(|| KronosError::Invariant("sync engine already started".into()))?;

        tracing::info!(
            interval = ?self.core.config.sync.interval,
            max_concurrent_passes = self.core.config.sync.max_concurrent_passes,
            "sync engine started"
        );

        Ok(EngineTasks {
            dispatcher: tokio::spawn(dispatch(Arc::clone(&self.core), receiver, self.queue.clone())),
            scheduler: tokio::spawn(schedule(Arc::clone(&self.core), self.queue.clone())),
        })
    }

    /// Run one pass now and wait for it.
    pub async fn sync_now(&self, calendar_id: CalendarId) -> KronosResult<PassOutcome> {
        self.calendar(calendar_id).await?;
        Ok(self.core.run_pass(calendar_id).await)
    }

    /// Queue an out-of-cycle pass and return without waiting for it.
    pub async fn trigger_sync(&self, calendar_id: CalendarId) -> KronosResult<()> {
        let calendar = self.calendar(calendar_id).await?;
        if !calendar.active {
            tracing::debug!(calendar_id = %calendar_id, "ignoring trigger for inactive calendar");
            return Ok(());
        }
        if let Err(e) = self.queue.try_send(calendar_id) {
            // The scheduler picks the calendar up on its next tick.
            tracing::warn!(calendar_id = %calendar_id, "sync queue rejected trigger: {}", e);
        }
        Ok(())
    }

    /// Stop syncing a calendar. Its events stay in place.
    ///
    /// Waits for the user's commit lock so a pass that is already committing
    /// finishes first; passes still fetching discard their work.
    pub async fn deactivate(&self, calendar_id: CalendarId) -> KronosResult<()> {
        let calendar = self.calendar(calendar_id).await?;
        let _guard = self
            .core
            .locks
            .acquire(calendar.user_id, self.core.config.sync.lock_timeout)
            .await
            .ok_or_else(|| {
                KronosError::CommitConflict(format!("timed out deactivating calendar {calendar_id}"))
            })?;

        self.core.store.set_calendar_active(calendar_id, false).await?;
        self.core.set_phase(calendar_id, SyncPhase::Deactivated);
        tracing::info!(calendar_id = %calendar_id, user_id = %calendar.user_id, "calendar deactivated");
        Ok(())
    }

    /// Write busy blocks for the user's events into each of their writable
    /// calendars, and remove blocks whose event has gone.
    pub async fn push_busy_blocks(&self, user_id: UserId) -> KronosResult<BusyBlockReport> {
        self.core.push_busy_blocks(user_id).await
    }

    /// Attach or clear a collaborator tag on a live event.
    ///
    /// Taken under the user's commit lock so a pass in flight cannot write
    /// back the event without it.
    pub async fn set_client_tag(
        &self,
        user_id: UserId,
        event_id: EventId,
        tag: Option<String>,
    ) -> KronosResult<()> {
        let _guard = self
            .core
            .locks
            .acquire(user_id, self.core.config.sync.lock_timeout)
            .await
            .ok_or_else(|| KronosError::CommitConflict(format!("timed out tagging event {event_id}")))?;
        self.core.store.set_client_tag(user_id, event_id, tag).await
    }

    /// Register a calendar created by the onboarding collaborator.
    pub async fn add_calendar(&self, calendar: Calendar) -> KronosResult<()> {
        if self.core.adapters.get(calendar.provider).is_none() {
            return Err(KronosError::Config(format!(
                "no adapter registered for {}",
                calendar.provider
            )));
        }
        calendar.tz()?;
        tracing::info!(calendar_id = %calendar.id, user_id = %calendar.user_id, provider = %calendar.provider, "calendar added");
        self.core.store.insert_calendar(calendar).await
    }

    /// Live events intersecting `range`, ordered by start.
    pub async fn events(&self, user_id: UserId, range: &DateRange) -> KronosResult<Vec<Event>> {
        let mut events: Vec<Event> = self
            .core
            .store
            .load_live_events(user_id)
            .await?
            .into_iter()
            .filter(|e| range.intersects(e.start, e.end))
            .collect();
        events.sort_by(|a, b| (a.start, a.end, a.id).cmp(&(b.start, b.end, b.id)));
        Ok(events)
    }

    pub async fn conflicts(&self, user_id: UserId) -> KronosResult<Vec<ConflictGroup>> {
        self.core.store.load_conflicts(user_id).await
    }

    pub async fn calendars(&self, user_id: UserId) -> KronosResult<Vec<CalendarSummary>> {
        let calendars = self.core.store.load_calendars(user_id).await?;
        Ok(calendars.iter().map(CalendarSummary::from).collect())
    }

    pub async fn sync_status(&self, user_id: UserId) -> KronosResult<SyncStatus> {
        let calendars = self.core.store.load_calendars(user_id).await?;
        let live_events = self.core.store.load_live_events(user_id).await?.len();
        let conflict_groups = self.core.store.load_conflicts(user_id).await?.len();

        let count = |health: CalendarHealth| calendars.iter().filter(|c| c.health() == health).count();
        Ok(SyncStatus {
            user_id,
            calendars_active: calendars.iter().filter(|c| c.active).count(),
            calendars_degraded: count(CalendarHealth::Degraded),
            calendars_deactivated: count(CalendarHealth::Deactivated),
            live_events,
            conflict_groups,
            last_successful_sync: calendars.iter().filter_map(|c| c.last_sync).max(),
            passes_in_flight: calendars
                .iter()
                .filter(|c| self.core.in_flight.contains(&c.id))
                .count(),
        })
    }

    pub fn phase(&self, calendar_id: CalendarId) -> SyncPhase {
        self.core
            .phases
            .get(&calendar_id)
            .map(|p| *p)
            .unwrap_or_default()
    }

    async fn calendar(&self, calendar_id: CalendarId) -> KronosResult<Calendar> {
        self.core
            .store
            .load_calendar(calendar_id)
            .await?
            .ok_or_else(|| KronosError::CalendarNotFound(calendar_id.to_string()))
    }
}

/// Run queued passes, at most one per calendar and `max_concurrent_passes` overall.
async fn dispatch(core: Arc<EngineCore>, mut receiver: mpsc::Receiver<CalendarId>, queue: mpsc::Sender<CalendarId>) {
    let permits = Arc::new(Semaphore::new(core.config.sync.max_concurrent_passes));

    while let Some(calendar_id) = receiver.recv().await {
        let Some(flight) = InFlight::claim(&core, calendar_id) else {
            tracing::debug!(calendar_id = %calendar_id, "pass already in flight, rerunning when it ends");
            core.dirty.insert(calendar_id);
            continue;
        };
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };

        let core = Arc::clone(&core);
        let queue = queue.clone();
        tokio::spawn(async move {
            let outcome = core.run_pass(calendar_id).await;
            drop(flight);
            drop(permit);

            if core.config.sync.busy_blocks && outcome.is_committed() {
                core.push_busy_blocks_after(calendar_id).await;
            }

            // Checked after the flight is released so a trigger racing the end
            // of the pass either claims a new flight or is seen here.
            let rerun = core.dirty.remove(&calendar_id).is_some();
            if outcome == PassOutcome::Requeued {
                tokio::time::sleep(core.config.sync.requeue_delay).await;
            } else if !rerun {
                return;
            }
            if queue.send(calendar_id).await.is_err() {
                tracing::warn!(calendar_id = %calendar_id, "sync queue closed, dropping pass");
            }
        });
    }
}

/// Enqueue every active calendar whose next sync is due.
async fn schedule(core: Arc<EngineCore>, queue: mpsc::Sender<CalendarId>) {
    let mut ticker = tokio::time::interval(core.config.sync.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = Utc::now();

        let calendars = match core.store.load_active_calendars().await {
            Ok(calendars) => calendars,
            Err(e) => {
                tracing::error!("scheduler could not load calendars: {}", e);
                continue;
            }
        };

        let due = calendars
            .into_iter()
            .filter(|c| c.is_due(now) && !core.in_flight.contains(&c.id));
        for calendar in due {
            if let Err(e) = queue.try_send(calendar.id) {
                tracing::warn!(calendar_id = %calendar.id, "sync queue full, deferring: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use uuid::Uuid;

    use crate::calendar::ProviderKind;
    use crate::conflict::Severity;
    use crate::error::{ProviderError, SyncErrorKind};
    use crate::event::test_support::at;
    use crate::provider::{Capabilities, ProviderAdapter};
    use crate::raw::{Delta, EventTime, RawEventRecord};
    use crate::store::{AccessToken, MemoryStore, StaticCredentials};

    /// Replays scripted fetch results and records the cursors it was called
    /// with, and the busy blocks written through it.
    struct ScriptedAdapter {
        kind: ProviderKind,
        script: std::sync::Mutex<VecDeque<Result<Delta, ProviderError>>>,
        cursors: std::sync::Mutex<Vec<Option<String>>>,
        gate: Option<Arc<Notify>>,
        busy_blocks: bool,
        writes: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedAdapter {
        fn new(kind: ProviderKind, script: Vec<Result<Delta, ProviderError>>) -> Self {
            ScriptedAdapter {
                kind,
                script: std::sync::Mutex::new(script.into()),
                cursors: std::sync::Mutex::new(Vec::new()),
                gate: None,
                busy_blocks: false,
                writes: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn gated(mut self, gate: Arc<Notify>) -> Self {
            self.gate = Some(gate);
            self
        }

        fn writable(mut self) -> Self {
            self.busy_blocks = true;
            self
        }

        fn cursors(&self) -> Vec<Option<String>> {
            self.cursors.lock().unwrap().clone()
        }

        fn writes(&self) -> Vec<String> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                incremental: true,
                push: false,
                busy_blocks: self.busy_blocks,
            }
        }

        async fn fetch_delta(
            &self,
            _calendar: &Calendar,
            cursor: Option<&str>,
            _window: &DateRange,
            _token: &AccessToken,
        ) -> Result<Delta, ProviderError> {
            self.cursors.lock().unwrap().push(cursor.map(str::to_string));
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(Delta::default()))
        }

        async fn upsert_busy_block(
            &self,
            _calendar: &Calendar,
            block: &BusyBlock,
            _token: &AccessToken,
        ) -> Result<(), ProviderError> {
            if !self.busy_blocks {
                return Err(ProviderError::Unsupported("busy blocks"));
            }
            self.writes.lock().unwrap().push(format!("upsert {}", block.id));
            Ok(())
        }

        async fn delete_busy_block(
            &self,
            _calendar: &Calendar,
            block_id: &str,
            _token: &AccessToken,
        ) -> Result<(), ProviderError> {
            if !self.busy_blocks {
                return Err(ProviderError::Unsupported("busy blocks"));
            }
            self.writes.lock().unwrap().push(format!("delete {block_id}"));
            Ok(())
        }
    }

    struct Harness {
        engine: SyncEngine,
        store: Arc<MemoryStore>,
        credentials: Arc<StaticCredentials>,
        user: UserId,
    }

    fn harness(adapters: Vec<Arc<ScriptedAdapter>>, config: EngineConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let credentials = Arc::new(StaticCredentials::new());
        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter);
        }
        let engine = SyncEngine::new(store.clone(), credentials.clone(), registry, config);
        Harness {
            engine,
            store,
            credentials,
            user: Uuid::new_v4(),
        }
    }

    impl Harness {
        async fn calendar(&self, provider: ProviderKind) -> Calendar {
            let calendar = Calendar::new(Uuid::new_v4(), self.user, provider, "primary", "UTC");
            self.credentials.insert(calendar.id, AccessToken::new("token"));
            self.engine.add_calendar(calendar.clone()).await.unwrap();
            calendar
        }

        async fn stored(&self, calendar_id: CalendarId) -> Calendar {
            self.store.load_calendar(calendar_id).await.unwrap().unwrap()
        }
    }

    fn record(id: &str, title: &str, start: (u32, u32), end: (u32, u32), attendees: &[&str]) -> RawEventRecord {
        let mut r = RawEventRecord::new(
            id,
            "1",
            title,
            EventTime::DateTimeUtc(at(start.0, start.1)),
            EventTime::DateTimeUtc(at(end.0, end.1)),
        );
        r.attendees = attendees.iter().map(|a| a.to_string()).collect();
        r
    }

    fn delta(records: Vec<RawEventRecord>, cursor: &str) -> Delta {
        Delta {
            records,
            next_cursor: Some(cursor.to_string()),
            complete: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_merges_across_calendars_and_detects_conflicts() {
        let google = Arc::new(ScriptedAdapter::new(
            ProviderKind::GoogleCalendar,
            vec![Ok(delta(
                vec![
                    record("g-standup", "Standup", (9, 0), (10, 0), &[]),
                    record("g-review", "Sync Review", (11, 0), (12, 0), &["a@x.com", "b@x.com"]),
                ],
                "g1",
            ))],
        ));
        let microsoft = Arc::new(ScriptedAdapter::new(
            ProviderKind::MicrosoftCalendar,
            vec![Ok(delta(
                vec![
                    record("m-1on1", "1:1", (9, 30), (10, 0), &[]),
                    record("m-review", "sync review", (11, 0), (12, 0), &["b@x.com", "a@x.com"]),
                ],
                "m1",
            ))],
        ));
        let h = harness(vec![google, microsoft], EngineConfig::default());
        let a = h.calendar(ProviderKind::GoogleCalendar).await;
        let b = h.calendar(ProviderKind::MicrosoftCalendar).await;

        assert!(h.engine.sync_now(a.id).await.unwrap().is_committed());
        let PassOutcome::Committed(stats) = h.engine.sync_now(b.id).await.unwrap() else {
            panic!("second pass should commit");
        };
        assert_eq!(stats.created, 1);
        assert_eq!(stats.conflict_groups, 1);

        let events = h.engine.events(h.user, &DateRange::unbounded()).await.unwrap();
        // The merged event may carry either calendar's spelling of the title.
        let titles: Vec<_> = events.iter().map(|e| e.title.to_lowercase()).collect();
        assert_eq!(titles, vec!["standup", "1:1", "sync review"]);

        let review = &events[2];
        assert_eq!(review.source_refs.len(), 2);
        assert_eq!(review.calendars().len(), 2);

        let conflicts = h.engine.conflicts(h.user).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, Severity::Medium);
        assert!(conflicts[0].contains(&events[0].id));
        assert!(conflicts[0].contains(&events[1].id));

        let cal = h.stored(a.id).await;
        assert_eq!(cal.sync_cursor.as_deref(), Some("g1"));
        assert!(cal.last_sync.is_some());
        assert_eq!(h.engine.phase(a.id), SyncPhase::Idle);

        let status = h.engine.sync_status(h.user).await.unwrap();
        assert_eq!(status.calendars_active, 2);
        assert_eq!(status.live_events, 3);
        assert_eq!(status.conflict_groups, 1);
        assert_eq!(status.calendars_degraded, 0);
    }

    #[tokio::test]
    async fn test_auth_expired_deactivates_and_keeps_timeline() {
        let adapter = Arc::new(ScriptedAdapter::new(
            ProviderKind::GoogleCalendar,
            vec![Ok(delta(
                vec![
                    record("a", "Planning", (9, 0), (10, 0), &[]),
                    record("b", "Interview", (9, 30), (10, 30), &[]),
                ],
                "c1",
            ))],
        ));
        let h = harness(vec![adapter], EngineConfig::default());
        let cal = h.calendar(ProviderKind::GoogleCalendar).await;
        assert!(h.engine.sync_now(cal.id).await.unwrap().is_committed());

        let events_before = h.engine.events(h.user, &DateRange::unbounded()).await.unwrap();
        let conflicts_before = h.engine.conflicts(h.user).await.unwrap();
        assert_eq!(conflicts_before.len(), 1);

        h.credentials.revoke(cal.id);
        let outcome = h.engine.sync_now(cal.id).await.unwrap();
        assert!(matches!(outcome, PassOutcome::Deactivated(ref e) if e.kind == SyncErrorKind::AuthExpired));

        let stored = h.stored(cal.id).await;
        assert!(!stored.active);
        assert_eq!(stored.last_error.unwrap().kind, SyncErrorKind::AuthExpired);
        assert_eq!(h.engine.phase(cal.id), SyncPhase::Deactivated);

        assert_eq!(h.engine.events(h.user, &DateRange::unbounded()).await.unwrap(), events_before);
        assert_eq!(h.engine.conflicts(h.user).await.unwrap(), conflicts_before);
    }

    #[tokio::test]
    async fn test_transient_failures_deactivate_at_threshold() {
        let script = (0..5)
            .map(|_| Err(ProviderError::Transient("503 from provider".into())))
            .collect();
        let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::GoogleCalendar, script));
        let h = harness(vec![adapter], EngineConfig::default());
        let cal = h.calendar(ProviderKind::GoogleCalendar).await;

        for attempt in 1..=4u32 {
            let outcome = h.engine.sync_now(cal.id).await.unwrap();
            let PassOutcome::Failed(error) = outcome else {
                panic!("attempt {attempt} should fail and retry");
            };
            assert_eq!(error.kind, SyncErrorKind::Transient);
            assert!(error.retry_at.is_some());

            let stored = h.stored(cal.id).await;
            assert!(stored.active);
            assert_eq!(stored.consecutive_failures, attempt);
        }
        assert_eq!(h.engine.sync_status(h.user).await.unwrap().calendars_degraded, 1);

        let outcome = h.engine.sync_now(cal.id).await.unwrap();
        assert!(matches!(outcome, PassOutcome::Deactivated(_)));
        assert!(!h.stored(cal.id).await.active);
    }

    #[tokio::test]
    async fn test_rate_limit_hint_sets_next_attempt() {
        let adapter = Arc::new(ScriptedAdapter::new(
            ProviderKind::GoogleCalendar,
            vec![Err(ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(3600)),
            })],
        ));
        let h = harness(vec![adapter], EngineConfig::default());
        let cal = h.calendar(ProviderKind::GoogleCalendar).await;

        let before = Utc::now();
        let PassOutcome::Failed(error) = h.engine.sync_now(cal.id).await.unwrap() else {
            panic!("rate limit should fail the pass");
        };
        assert_eq!(error.kind, SyncErrorKind::RateLimited);

        let stored = h.stored(cal.id).await;
        let next = stored.next_sync_at.unwrap();
        assert!(next >= before + chrono::Duration::minutes(59));
        assert!(stored.active);
        assert!(!stored.is_due(Utc::now()));
    }

    #[tokio::test]
    async fn test_invalidated_cursor_triggers_full_fetch() {
        let adapter = Arc::new(ScriptedAdapter::new(
            ProviderKind::GoogleCalendar,
            vec![
                Err(ProviderError::FullResyncRequired),
                Ok(delta(vec![record("a", "Planning", (9, 0), (10, 0), &[])], "fresh")),
            ],
        ));
        let h = harness(vec![adapter.clone()], EngineConfig::default());
        let mut cal = h.calendar(ProviderKind::GoogleCalendar).await;
        cal.sync_cursor = Some("c1".into());
        cal.window_anchor = Some(Utc::now());
        h.store.insert_calendar(cal.clone()).await.unwrap();

        assert!(h.engine.sync_now(cal.id).await.unwrap().is_committed());
        assert_eq!(adapter.cursors(), vec![Some("c1".to_string()), None]);
        assert_eq!(h.stored(cal.id).await.sync_cursor.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_stale_window_discards_cursor() {
        let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::GoogleCalendar, vec![]));
        let h = harness(vec![adapter.clone()], EngineConfig::default());
        let mut cal = h.calendar(ProviderKind::GoogleCalendar).await;
        cal.sync_cursor = Some("c1".into());
        cal.window_anchor = Some(Utc::now() - chrono::Duration::days(8));
        h.store.insert_calendar(cal.clone()).await.unwrap();

        h.engine.sync_now(cal.id).await.unwrap();
        assert_eq!(adapter.cursors(), vec![None]);

        let anchor = h.stored(cal.id).await.window_anchor.unwrap();
        assert!(Utc::now() - anchor < chrono::Duration::minutes(1));
    }

    #[tokio::test]
    async fn test_lock_timeout_requeues() {
        let adapter = Arc::new(ScriptedAdapter::new(
            ProviderKind::GoogleCalendar,
            vec![Ok(delta(vec![record("a", "Planning", (9, 0), (10, 0), &[])], "c1"))],
        ));
        let mut config = EngineConfig::default();
        config.sync.lock_timeout = Duration::from_millis(20);
        let h = harness(vec![adapter], config);
        let cal = h.calendar(ProviderKind::GoogleCalendar).await;

        let held = h.engine.core.locks.acquire(h.user, Duration::from_secs(1)).await.unwrap();
        assert_eq!(h.engine.sync_now(cal.id).await.unwrap(), PassOutcome::Requeued);
        drop(held);

        let stored = h.stored(cal.id).await;
        assert_eq!(stored.last_error.unwrap().kind, SyncErrorKind::CommitConflict);
        assert!(stored.active);
        assert!(h.engine.events(h.user, &DateRange::unbounded()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deactivation_mid_fetch_discards_work() {
        let gate = Arc::new(Notify::new());
        let adapter = Arc::new(
            ScriptedAdapter::new(
                ProviderKind::GoogleCalendar,
                vec![Ok(delta(vec![record("a", "Planning", (9, 0), (10, 0), &[])], "c1"))],
            )
            .gated(gate.clone()),
        );
        let h = Arc::new(harness(vec![adapter], EngineConfig::default()));
        let cal = h.calendar(ProviderKind::GoogleCalendar).await;

        let pass = {
            let h = h.clone();
            tokio::spawn(async move { h.engine.sync_now(cal.id).await })
        };
        while h.engine.phase(cal.id) != SyncPhase::Fetching {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.engine.deactivate(cal.id).await.unwrap();
        gate.notify_one();

        assert_eq!(pass.await.unwrap().unwrap(), PassOutcome::Cancelled);
        assert!(h.engine.events(h.user, &DateRange::unbounded()).await.unwrap().is_empty());
        assert_eq!(h.stored(cal.id).await.sync_cursor, None);
    }

    #[tokio::test]
    async fn test_trigger_sync_returns_before_pass_completes() {
        let gate = Arc::new(Notify::new());
        let adapter = Arc::new(
            ScriptedAdapter::new(
                ProviderKind::GoogleCalendar,
                vec![Ok(delta(vec![record("a", "Planning", (9, 0), (10, 0), &[])], "c1"))],
            )
            .gated(gate.clone()),
        );
        let h = harness(vec![adapter], EngineConfig::default());
        let cal = h.calendar(ProviderKind::GoogleCalendar).await;
        let tasks = h.engine.start().unwrap();

        h.engine.trigger_sync(cal.id).await.unwrap();
        assert!(h.engine.events(h.user, &DateRange::unbounded()).await.unwrap().is_empty());

        gate.notify_one();
        let mut events = Vec::new();
        for _ in 0..200 {
            events = h.engine.events(h.user, &DateRange::unbounded()).await.unwrap();
            if !events.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tasks.abort();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Planning");
    }

    #[tokio::test]
    async fn test_trigger_during_pass_runs_again_after_it() {
        let gate = Arc::new(Notify::new());
        let adapter = Arc::new(
            ScriptedAdapter::new(
                ProviderKind::GoogleCalendar,
                vec![
                    Ok(delta(vec![record("a", "Planning", (9, 0), (10, 0), &[])], "c1")),
                    Ok(delta(
                        vec![
                            record("a", "Planning", (9, 0), (10, 0), &[]),
                            record("b", "Review", (11, 0), (12, 0), &[]),
                        ],
                        "c2",
                    )),
                ],
            )
            .gated(gate.clone()),
        );
        let h = harness(vec![adapter.clone()], EngineConfig::default());
        let cal = h.calendar(ProviderKind::GoogleCalendar).await;

        // Dispatcher only: the scheduler's first tick would enqueue the calendar too.
        let receiver = h.engine.receiver.lock().unwrap().take().unwrap();
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&h.engine.core), receiver, h.engine.queue.clone()));

        h.engine.trigger_sync(cal.id).await.unwrap();
        while h.engine.phase(cal.id) != SyncPhase::Fetching {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.engine.trigger_sync(cal.id).await.unwrap();
        while !h.engine.core.dirty.contains(&cal.id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        gate.notify_one();
        for _ in 0..200 {
            if adapter.cursors().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        gate.notify_one();
        let mut events = Vec::new();
        for _ in 0..200 {
            events = h.engine.events(h.user, &DateRange::unbounded()).await.unwrap();
            if events.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        dispatcher.abort();

        assert_eq!(adapter.cursors(), vec![None, Some("c1".to_string())]);
        assert_eq!(events.len(), 2);
        assert!(!h.engine.core.dirty.contains(&cal.id));
    }

    #[tokio::test]
    async fn test_malformed_record_in_complete_set_keeps_event() {
        let mut inverted = record("a", "Planning", (10, 0), (9, 0), &[]);
        inverted.revision = "2".into();
        let mut undecodable = Delta {
            records: vec![record("b", "Interview", (9, 30), (10, 30), &[])],
            next_cursor: Some("c3".into()),
            complete: true,
            ..Default::default()
        };
        undecodable.skip(Some("a".into()));

        let adapter = Arc::new(ScriptedAdapter::new(
            ProviderKind::GoogleCalendar,
            vec![
                Ok(delta(
                    vec![
                        record("a", "Planning", (9, 0), (10, 0), &[]),
                        record("b", "Interview", (9, 30), (10, 30), &[]),
                    ],
                    "c1",
                )),
                Ok(delta(vec![inverted, record("b", "Interview", (9, 30), (10, 30), &[])], "c2")),
                Ok(undecodable),
            ],
        ));
        let h = harness(vec![adapter], EngineConfig::default());
        let cal = h.calendar(ProviderKind::GoogleCalendar).await;
        assert!(h.engine.sync_now(cal.id).await.unwrap().is_committed());
        let before = h.engine.events(h.user, &DateRange::unbounded()).await.unwrap();
        assert_eq!(h.engine.conflicts(h.user).await.unwrap().len(), 1);

        // The normalizer rejects the new revision; then the adapter cannot decode it at all.
        for _ in 0..2 {
            let PassOutcome::Committed(stats) = h.engine.sync_now(cal.id).await.unwrap() else {
                panic!("pass should commit");
            };
            assert_eq!(stats.skipped, 1);
            assert_eq!(stats.tombstoned, 0);
            assert_eq!(h.engine.events(h.user, &DateRange::unbounded()).await.unwrap(), before);
            assert_eq!(h.engine.conflicts(h.user).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_busy_blocks_follow_events_in_other_calendars() {
        let soon = Utc::now() + chrono::Duration::days(1);
        let timed = |id: &str, title: &str, hour: i64| {
            RawEventRecord::new(
                id,
                "1",
                title,
                EventTime::DateTimeUtc(soon + chrono::Duration::hours(hour)),
                EventTime::DateTimeUtc(soon + chrono::Duration::hours(hour + 1)),
            )
        };
        let google = Arc::new(
            ScriptedAdapter::new(
                ProviderKind::GoogleCalendar,
                vec![Ok(delta(vec![timed("g-gym", "Gym", 0)], "g1"))],
            )
            .writable(),
        );
        let microsoft = Arc::new(ScriptedAdapter::new(
            ProviderKind::MicrosoftCalendar,
            vec![
                Ok(delta(vec![timed("m-dentist", "Dentist", 3)], "m1")),
                Ok(delta(vec![], "m2")),
            ],
        ));
        let h = harness(vec![google.clone(), microsoft], EngineConfig::default());
        let work = h.calendar(ProviderKind::GoogleCalendar).await;
        let personal = h.calendar(ProviderKind::MicrosoftCalendar).await;
        h.engine.sync_now(work.id).await.unwrap();
        h.engine.sync_now(personal.id).await.unwrap();

        let events = h.engine.events(h.user, &DateRange::unbounded()).await.unwrap();
        let dentist = events.iter().find(|e| e.title == "Dentist").unwrap();
        let block = BusyBlock::for_event(work.id, dentist);

        let report = h.engine.push_busy_blocks(h.user).await.unwrap();
        assert_eq!(
            report,
            BusyBlockReport {
                calendars: 1,
                written: 1,
                ..Default::default()
            }
        );
        assert_eq!(google.writes(), vec![format!("upsert {}", block.id)]);

        let report = h.engine.push_busy_blocks(h.user).await.unwrap();
        assert_eq!((report.written, report.unchanged), (0, 1));
        assert_eq!(google.writes().len(), 1);

        // The dentist appointment is cancelled at the source.
        h.engine.sync_now(personal.id).await.unwrap();
        let report = h.engine.push_busy_blocks(h.user).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(google.writes().last(), Some(&format!("delete {}", block.id)));
    }

    #[tokio::test]
    async fn test_client_tag_survives_provider_update() {
        let mut moved = record("a", "Planning (moved)", (13, 0), (14, 0), &[]);
        moved.revision = "2".into();
        let adapter = Arc::new(ScriptedAdapter::new(
            ProviderKind::GoogleCalendar,
            vec![
                Ok(delta(vec![record("a", "Planning", (9, 0), (10, 0), &[])], "c1")),
                Ok(delta(vec![moved], "c2")),
            ],
        ));
        let h = harness(vec![adapter], EngineConfig::default());
        let cal = h.calendar(ProviderKind::GoogleCalendar).await;
        h.engine.sync_now(cal.id).await.unwrap();
        let id = h.engine.events(h.user, &DateRange::unbounded()).await.unwrap()[0].id;

        h.engine.set_client_tag(h.user, id, Some("crm-42".into())).await.unwrap();
        assert!(h.engine.sync_now(cal.id).await.unwrap().is_committed());

        let events = h.engine.events(h.user, &DateRange::unbounded()).await.unwrap();
        assert_eq!(events[0].id, id);
        assert_eq!(events[0].start, at(13, 0));
        assert_eq!(events[0].client_tag.as_deref(), Some("crm-42"));

        h.engine.set_client_tag(h.user, id, None).await.unwrap();
        let events = h.engine.events(h.user, &DateRange::unbounded()).await.unwrap();
        assert_eq!(events[0].client_tag, None);

        let missing = h.engine.set_client_tag(h.user, Uuid::new_v4(), None).await;
        assert!(matches!(missing, Err(KronosError::EventNotFound(_))));
    }

    #[tokio::test]
    async fn test_start_twice_is_error() {
        let h = harness(vec![], EngineConfig::default());
        let tasks = h.engine.start().unwrap();
        assert!(matches!(h.engine.start(), Err(KronosError::Invariant(_))));
        tasks.abort();
    }

    #[tokio::test]
    async fn test_unknown_calendar() {
        let h = harness(vec![], EngineConfig::default());
        let id = Uuid::new_v4();
        assert!(matches!(h.engine.trigger_sync(id).await, Err(KronosError::CalendarNotFound(_))));
        assert!(matches!(h.engine.sync_now(id).await, Err(KronosError::CalendarNotFound(_))));
        assert!(matches!(h.engine.deactivate(id).await, Err(KronosError::CalendarNotFound(_))));
    }

    #[tokio::test]
    async fn test_calendar_without_adapter_rejected() {
        let h = harness(vec![], EngineConfig::default());
        let calendar = Calendar::new(Uuid::new_v4(), h.user, ProviderKind::CalDotCom, "acct", "UTC");
        assert!(matches!(h.engine.add_calendar(calendar).await, Err(KronosError::Config(_))));
    }

    #[tokio::test]
    async fn test_events_filtered_by_range_and_ordered() {
        let adapter = Arc::new(ScriptedAdapter::new(
            ProviderKind::GoogleCalendar,
            vec![Ok(delta(
                vec![
                    record("late", "Retro", (15, 0), (16, 0), &[]),
                    record("early", "Standup", (9, 0), (9, 15), &[]),
                    record("mid", "Lunch", (12, 0), (13, 0), &[]),
                ],
                "c1",
            ))],
        ));
        let h = harness(vec![adapter], EngineConfig::default());
        let cal = h.calendar(ProviderKind::GoogleCalendar).await;
        h.engine.sync_now(cal.id).await.unwrap();

        let all = h.engine.events(h.user, &DateRange::unbounded()).await.unwrap();
        let titles: Vec<_> = all.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Standup", "Lunch", "Retro"]);

        let afternoon = DateRange::new(at(12, 30), at(18, 0));
        let titles: Vec<_> = h
            .engine
            .events(h.user, &afternoon)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.title)
            .collect();
        assert_eq!(titles, vec!["Lunch", "Retro"]);

        let summaries = h.engine.calendars(h.user).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].health, CalendarHealth::Healthy);
    }
}
