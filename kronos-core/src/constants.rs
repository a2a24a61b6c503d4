//! Engine-wide defaults. Each can be overridden through [`crate::config::EngineConfig`].

/// Default polling interval per calendar, in seconds.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5 * 60;

/// Consecutive failures after which a calendar is deactivated.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 2 * 60;

pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 30;
pub const DEFAULT_BACKOFF_CAP_SECS: u64 = 30 * 60;

/// Days of recurring occurrences materialized before "now".
pub const DEFAULT_EXPANSION_PAST_DAYS: i64 = 30;
/// Days of recurring occurrences materialized after "now".
pub const DEFAULT_EXPANSION_FUTURE_DAYS: i64 = 365;
/// Hard cap on occurrences materialized for a single series.
pub const DEFAULT_MAX_OCCURRENCES: u16 = 1000;

/// Maximum start/end skew for two events to count as the same interval.
pub const DEFAULT_MERGE_TOLERANCE_SECS: i64 = 60;
pub const DEFAULT_MERGE_THRESHOLD: f64 = 0.75;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:4096";

/// Concurrent sync passes across all users.
pub const DEFAULT_MAX_CONCURRENT_PASSES: usize = 16;
/// Age of the expansion window after which a full re-fetch re-anchors it.
pub const DEFAULT_REWINDOW_AFTER_SECS: u64 = 7 * 24 * 60 * 60;
/// Delay before a pass that lost the commit lock is retried.
pub const DEFAULT_REQUEUE_DELAY_SECS: u64 = 5;
/// How often the scheduler looks for due calendars.
pub const DEFAULT_SCHEDULER_TICK_SECS: u64 = 15;

/// Title of the placeholder events written into other calendars.
pub const BUSY_BLOCK_TITLE: &str = "BUSY";
