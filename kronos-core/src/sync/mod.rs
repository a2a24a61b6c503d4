//! Sync orchestrator: drives provider passes per calendar, commits them
//! under the user's lock and records failures on the calendar.

mod backoff;
mod busy;
mod engine;
mod locks;
mod pass;
mod phase;

pub use backoff::Backoff;
pub use busy::BusyBlockReport;
pub use engine::{EngineTasks, SyncEngine, SyncStatus};
pub use locks::UserLocks;
pub use pass::{PassOutcome, PassStats};
pub use phase::SyncPhase;
