//! Persistence and credential contracts consumed by the engine.
//!
//! The datastore itself is a collaborator; [`MemoryStore`] is the in-process
//! implementation used by the server binary and by tests.

mod credentials;
mod memory;

pub use credentials::{AccessToken, CredentialSource, StaticCredentials};
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::calendar::{Calendar, SyncStateUpdate};
use crate::conflict::ConflictGroup;
use crate::error::KronosResult;
use crate::event::{CalendarId, Event, EventId, UserId};

/// Event rows touched by one pass. Tombstoned events carry `tombstoned_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventChanges {
    pub upserted: Vec<Event>,
}

impl EventChanges {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty()
    }

    pub fn tombstoned(&self) -> usize {
        self.upserted.iter().filter(|e| !e.is_live()).count()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_calendar(&self, calendar_id: CalendarId) -> KronosResult<Option<Calendar>>;

    async fn load_calendars(&self, user_id: UserId) -> KronosResult<Vec<Calendar>>;

    /// Every active calendar, for the periodic scheduler.
    async fn load_active_calendars(&self) -> KronosResult<Vec<Calendar>>;

    async fn insert_calendar(&self, calendar: Calendar) -> KronosResult<()>;

    async fn load_live_events(&self, user_id: UserId) -> KronosResult<Vec<Event>>;

    async fn load_conflicts(&self, user_id: UserId) -> KronosResult<Vec<ConflictGroup>>;

    /// Apply event changes and replace the user's conflict groups as one unit.
    async fn commit_delta(
        &self,
        user_id: UserId,
        changes: EventChanges,
        conflicts: Vec<ConflictGroup>,
    ) -> KronosResult<()>;

    /// Set or clear the collaborator tag on a live event. Later passes carry it forward.
    async fn set_client_tag(
        &self,
        user_id: UserId,
        event_id: EventId,
        tag: Option<String>,
    ) -> KronosResult<()>;

    async fn update_calendar_sync_state(
        &self,
        calendar_id: CalendarId,
        update: SyncStateUpdate,
    ) -> KronosResult<()>;

    /// Collaborator-initiated deactivation (revoked access).
    async fn set_calendar_active(&self, calendar_id: CalendarId, active: bool) -> KronosResult<()>;
}
