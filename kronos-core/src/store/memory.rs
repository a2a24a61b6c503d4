//! In-process [`Store`] backed by concurrent maps.
//!
//! Each user's events and conflict groups live in one immutable snapshot that
//! a commit swaps as a whole, so readers never see events from one pass next
//! to conflict groups from another.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{EventChanges, Store};
use crate::calendar::{Calendar, SyncStateUpdate};
use crate::conflict::ConflictGroup;
use crate::error::{KronosError, KronosResult};
use crate::event::{CalendarId, Event, EventId, UserId};

#[derive(Debug, Default)]
struct Snapshot {
    /// Live and tombstoned rows.
    events: BTreeMap<EventId, Event>,
    conflicts: Vec<ConflictGroup>,
}

#[derive(Default)]
pub struct MemoryStore {
    calendars: DashMap<CalendarId, Calendar>,
    timelines: DashMap<UserId, Arc<Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored row for a user, tombstones included.
    pub fn all_events(&self, user_id: UserId) -> Vec<Event> {
        self.snapshot(user_id).events.values().cloned().collect()
    }

    fn snapshot(&self, user_id: UserId) -> Arc<Snapshot> {
        self.timelines
            .get(&user_id)
            .map(|s| Arc::clone(s.value()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_calendar(&self, calendar_id: CalendarId) -> KronosResult<Option<Calendar>> {
        Ok(self.calendars.get(&calendar_id).map(|c| c.value().clone()))
    }

    async fn load_calendars(&self, user_id: UserId) -> KronosResult<Vec<Calendar>> {
        let mut calendars: Vec<Calendar> = self
            .calendars
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.value().clone())
            .collect();
        calendars.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(calendars)
    }

    async fn load_active_calendars(&self) -> KronosResult<Vec<Calendar>> {
        Ok(self
            .calendars
            .iter()
            .filter(|c| c.active)
            .map(|c| c.value().clone())
            .collect())
    }

    async fn insert_calendar(&self, calendar: Calendar) -> KronosResult<()> {
        self.calendars.insert(calendar.id, calendar);
        Ok(())
    }

    async fn load_live_events(&self, user_id: UserId) -> KronosResult<Vec<Event>> {
        Ok(self
            .snapshot(user_id)
            .events
            .values()
            .filter(|e| e.is_live())
            .cloned()
            .collect())
    }

    async fn load_conflicts(&self, user_id: UserId) -> KronosResult<Vec<ConflictGroup>> {
        Ok(self.snapshot(user_id).conflicts.clone())
    }

    async fn commit_delta(
        &self,
        user_id: UserId,
        changes: EventChanges,
        conflicts: Vec<ConflictGroup>,
    ) -> KronosResult<()> {
        for event in &changes.upserted {
            if event.user_id != user_id {
                return Err(KronosError::Store(format!(
                    "event {} belongs to user {}, not {user_id}",
                    event.id, event.user_id
                )));
            }
            event.validate()?;
        }

        let mut entry = self.timelines.entry(user_id).or_default();
        let mut events = entry.events.clone();
        for event in changes.upserted {
            events.insert(event.id, event);
        }
        *entry = Arc::new(Snapshot { events, conflicts });
        Ok(())
    }

    async fn set_client_tag(
        &self,
        user_id: UserId,
        event_id: EventId,
        tag: Option<String>,
    ) -> KronosResult<()> {
        let not_found = || KronosError::EventNotFound(event_id.to_string());
        let mut entry = self.timelines.get_mut(&user_id).ok_or_else(not_found)?;
        let mut events = entry.events.clone();
        let event = events
            .get_mut(&event_id)
            .filter(|e| e.is_live())
            .ok_or_else(not_found)?;
        event.client_tag = tag;
        let conflicts = entry.conflicts.clone();
        *entry = Arc::new(Snapshot { events, conflicts });
        Ok(())
    }

    async fn update_calendar_sync_state(
        &self,
        calendar_id: CalendarId,
        update: SyncStateUpdate,
    ) -> KronosResult<()> {
        let mut calendar = self
            .calendars
            .get_mut(&calendar_id)
            .ok_or_else(|| KronosError::CalendarNotFound(calendar_id.to_string()))?;
        calendar.apply(&update);
        Ok(())
    }

    async fn set_calendar_active(&self, calendar_id: CalendarId, active: bool) -> KronosResult<()> {
        let mut calendar = self
            .calendars
            .get_mut(&calendar_id)
            .ok_or_else(|| KronosError::CalendarNotFound(calendar_id.to_string()))?;
        calendar.active = active;
        Ok(())
    }
}
