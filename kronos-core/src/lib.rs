//! Calendar synchronization and conflict detection for kronos.
//!
//! Pulls events from a user's provider calendars, folds duplicates of the same
//! meeting into one canonical event and keeps the user's conflict groups in
//! step with every committed change.

pub mod calendar;
pub mod config;
pub mod conflict;
pub mod constants;
pub mod date_range;
pub mod dedup;
pub mod error;
pub mod event;
pub mod normalize;
pub mod provider;
pub mod raw;
pub mod recurrence;
pub mod store;
pub mod sync;

pub use calendar::{Calendar, CalendarHealth, CalendarSummary, ProviderKind};
pub use config::EngineConfig;
pub use conflict::{ConflictGroup, OverlapPair, Severity, detect_conflicts};
pub use date_range::DateRange;
pub use error::{KronosError, KronosResult, ProviderError, SyncError, SyncErrorKind};
pub use event::{CalendarId, Event, EventId, UserId};
pub use sync::{BusyBlockReport, PassOutcome, SyncEngine, SyncPhase, SyncStatus};
