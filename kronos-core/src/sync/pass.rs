//! One sync pass for one calendar.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::SyncPhase;
use super::engine::EngineCore;
use crate::calendar::{Calendar, SyncStateUpdate};
use crate::conflict::detect_conflicts;
use crate::date_range::DateRange;
use crate::error::{KronosError, ProviderError, SyncError, SyncErrorKind};
use crate::event::CalendarId;
use crate::normalize::Normalizer;
use crate::raw::Delta;

/// How a pass ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Committed(PassStats),
    /// Failed and scheduled for retry; the calendar stays active.
    Failed(SyncError),
    /// Failed in a way that deactivated the calendar.
    Deactivated(SyncError),
    /// The calendar was deactivated or removed mid-flight; nothing was written.
    Cancelled,
    /// The commit lock was not granted in time; run the pass again later.
    Requeued,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub created: usize,
    pub updated: usize,
    pub tombstoned: usize,
    pub skipped: usize,
    pub conflict_groups: usize,
}

/// Why a pass stopped early.
enum Abort {
    Cancelled,
    Provider(ProviderError),
    LockTimeout,
    Commit(KronosError),
    Internal(KronosError),
}

impl From<KronosError> for Abort {
    fn from(err: KronosError) -> Self {
        Abort::Internal(err)
    }
}

impl EngineCore {
    pub(crate) async fn run_pass(&self, calendar_id: CalendarId) -> PassOutcome {
        let now = Utc::now();
        match self.try_pass(calendar_id, now).await {
            Ok(stats) => {
                self.set_phase(calendar_id, SyncPhase::Idle);
                PassOutcome::Committed(stats)
            }
            Err(abort) => self.settle(calendar_id, abort, now).await,
        }
    }

    async fn try_pass(&self, calendar_id: CalendarId, now: DateTime<Utc>) -> Result<PassStats, Abort> {
        let calendar = self.reload(calendar_id).await?;
        let config = &self.config;

        // An expansion window older than `rewindow_after` is re-anchored with a full fetch.
        let rewindow_after = chrono::Duration::from_std(config.sync.rewindow_after)
            .map_err(|e| KronosError::Config(e.to_string()))?;
        let (anchor, cursor) = match calendar.window_anchor {
            Some(anchor) if now - anchor <= rewindow_after => (anchor, calendar.sync_cursor.clone()),
            _ => (now, None),
        };
        let window = DateRange::expansion(anchor, config.expansion.past_days, config.expansion.future_days);

        self.set_phase(calendar_id, SyncPhase::Fetching);
        let delta = self.fetch(&calendar, cursor, &window).await?;

        let calendar = self.reload(calendar_id).await?;
        self.set_phase(calendar_id, SyncPhase::Normalizing);
        let normalizer = Normalizer::new(window, config.expansion.max_occurrences);
        let fetched_skips = delta.skipped;
        let next_cursor = delta.next_cursor;
        let mut normalized = normalizer.normalize(&calendar, delta.records, delta.removed, delta.complete)?;
        normalized.skipped_ids.extend(delta.skipped_ids);
        let skipped = fetched_skips + normalized.skipped;

        self.set_phase(calendar_id, SyncPhase::Merging);
        let _guard = self
            .locks
            .acquire(calendar.user_id, config.sync.lock_timeout)
            .await
            .ok_or(Abort::LockTimeout)?;

        let calendar = self.reload(calendar_id).await?;
        let existing = self.store.load_live_events(calendar.user_id).await?;
        let outcome = self.resolver.resolve(&calendar, &existing, normalized, now)?;

        let calendar = self.reload(calendar_id).await?;
        self.set_phase(calendar_id, SyncPhase::Committing);
        let conflicts = detect_conflicts(calendar.user_id, &outcome.timeline);
        let stats = PassStats {
            created: outcome.created,
            updated: outcome.updated,
            tombstoned: outcome.tombstoned,
            skipped,
            conflict_groups: conflicts.len(),
        };
        self.store
            .commit_delta(calendar.user_id, outcome.changes, conflicts)
            .await
            .map_err(Abort::Commit)?;

        let update = SyncStateUpdate {
            cursor: next_cursor,
            last_sync: Some(now),
            last_error: None,
            consecutive_failures: 0,
            next_sync_at: Some(later(now, config.sync.interval)),
            window_anchor: Some(anchor),
            deactivate: false,
        };
        self.store.update_calendar_sync_state(calendar_id, update).await?;

        tracing::info!(
            calendar_id = %calendar_id,
            user_id = %calendar.user_id,
            created = stats.created,
            updated = stats.updated,
            tombstoned = stats.tombstoned,
            skipped = stats.skipped,
            conflicts = stats.conflict_groups,
            "sync pass committed"
        );

        Ok(stats)
    }

    /// Fetch with a token, retrying once without a cursor if the provider
    /// invalidated it.
    async fn fetch(
        &self,
        calendar: &Calendar,
        cursor: Option<String>,
        window: &DateRange,
    ) -> Result<Delta, Abort> {
        let token = self
            .credentials
            .valid_token(calendar.id)
            .await
            .map_err(Abort::Provider)?;
        let adapter = self.adapters.get(calendar.provider).ok_or_else(|| {
            Abort::Internal(KronosError::Config(format!(
                "no adapter registered for {}",
                calendar.provider
            )))
        })?;
        let timeout = self.config.sync.fetch_timeout;

        let fetch_once = |cursor: Option<String>| {
            let adapter = adapter.clone();
            let token = token.clone();
            async move {
                tokio::time::timeout(timeout, adapter.fetch_delta(calendar, cursor.as_deref(), window, &token))
                    .await
                    .unwrap_or_else(|_| Err(ProviderError::Transient(format!("fetch exceeded {timeout:?}"))))
            }
        };

        match fetch_once(cursor.clone()).await {
            Err(ProviderError::FullResyncRequired) if cursor.is_some() => {
                tracing::info!(calendar_id = %calendar.id, "cursor invalidated, fetching full set");
                match fetch_once(None).await {
                    Err(ProviderError::FullResyncRequired) => Err(Abort::Provider(ProviderError::Transient(
                        "provider rejected a full fetch".to_string(),
                    ))),
                    other => other.map_err(Abort::Provider),
                }
            }
            Err(ProviderError::FullResyncRequired) => Err(Abort::Provider(ProviderError::Transient(
                "provider rejected a full fetch".to_string(),
            ))),
            other => other.map_err(Abort::Provider),
        }
    }

    /// The calendar, if still active. Checked before every phase.
    async fn reload(&self, calendar_id: CalendarId) -> Result<Calendar, Abort> {
        match self.store.load_calendar(calendar_id).await? {
            Some(calendar) if calendar.active => Ok(calendar),
            _ => Err(Abort::Cancelled),
        }
    }

    /// Record the outcome of an aborted pass on the calendar.
    async fn settle(&self, calendar_id: CalendarId, abort: Abort, now: DateTime<Utc>) -> PassOutcome {
        if let Abort::Cancelled = abort {
            tracing::info!(calendar_id = %calendar_id, "calendar deactivated mid-pass, discarding work");
            self.set_phase(calendar_id, SyncPhase::Deactivated);
            return PassOutcome::Cancelled;
        }

        let calendar = match self.store.load_calendar(calendar_id).await {
            Ok(Some(calendar)) => calendar,
            Ok(None) => return PassOutcome::Cancelled,
            Err(e) => {
                tracing::error!(calendar_id = %calendar_id, "could not load calendar to record failure: {}", e);
                self.set_phase(calendar_id, SyncPhase::Failed);
                return PassOutcome::Failed(SyncError::new(SyncErrorKind::Internal, e.to_string()));
            }
        };
        let mut state = calendar.sync_state();
        let outcome = self.apply_failure(&calendar, &mut state, abort, now);

        if let Err(e) = self.store.update_calendar_sync_state(calendar_id, state).await {
            tracing::error!(calendar_id = %calendar_id, "could not record sync failure: {}", e);
        }
        let phase = match outcome {
            PassOutcome::Deactivated(_) | PassOutcome::Cancelled => SyncPhase::Deactivated,
            _ => SyncPhase::Failed,
        };
        self.set_phase(calendar_id, phase);
        outcome
    }

    fn apply_failure(
        &self,
        calendar: &Calendar,
        state: &mut SyncStateUpdate,
        abort: Abort,
        now: DateTime<Utc>,
    ) -> PassOutcome {
        let sync = &self.config.sync;
        let after = |delay: Duration| later(now, delay);

        match abort {
            Abort::Provider(ProviderError::AuthExpired(message)) => {
                let error = SyncError::new(SyncErrorKind::AuthExpired, message);
                tracing::warn!(calendar_id = %calendar.id, user_id = %calendar.user_id, "credentials expired, deactivating: {}", error.message);
                state.deactivate = true;
                state.last_error = Some(error.clone());
                state.next_sync_at = None;
                PassOutcome::Deactivated(error)
            }
            Abort::Provider(err) => {
                let kind = SyncErrorKind::from(&err);
                let retry_after = match &err {
                    ProviderError::RateLimited { retry_after } => *retry_after,
                    _ => None,
                };
                state.consecutive_failures = calendar.consecutive_failures.saturating_add(1);

                if state.consecutive_failures >= sync.failure_threshold {
                    let error = SyncError::new(kind, err.to_string());
                    tracing::warn!(
                        calendar_id = %calendar.id,
                        failures = state.consecutive_failures,
                        "failure threshold reached, deactivating: {}",
                        err
                    );
                    state.deactivate = true;
                    state.last_error = Some(error.clone());
                    state.next_sync_at = None;
                    return PassOutcome::Deactivated(error);
                }

                let jittered = self.backoff.delay(state.consecutive_failures, &mut rand::rng());
                let delay = retry_after.map_or(jittered, |hint| hint.max(jittered));
                let retry_at = after(delay);
                let error = SyncError::new(kind, err.to_string()).with_retry_at(retry_at);
                tracing::warn!(
                    calendar_id = %calendar.id,
                    failures = state.consecutive_failures,
                    retry_at = %retry_at,
                    "sync pass failed: {}",
                    err
                );
                state.last_error = Some(error.clone());
                state.next_sync_at = Some(retry_at);
                PassOutcome::Failed(error)
            }
            Abort::LockTimeout => {
                let retry_at = after(sync.requeue_delay);
                tracing::warn!(calendar_id = %calendar.id, user_id = %calendar.user_id, "commit lock not granted in time, requeueing");
                state.last_error = Some(
                    SyncError::new(SyncErrorKind::CommitConflict, "commit lock timed out").with_retry_at(retry_at),
                );
                state.next_sync_at = Some(retry_at);
                PassOutcome::Requeued
            }
            Abort::Commit(err) => {
                let retry_at = after(sync.interval);
                tracing::error!(calendar_id = %calendar.id, user_id = %calendar.user_id, "commit failed: {}", err);
                let error = SyncError::new(SyncErrorKind::CommitConflict, err.to_string()).with_retry_at(retry_at);
                state.last_error = Some(error.clone());
                state.next_sync_at = Some(retry_at);
                PassOutcome::Failed(error)
            }
            Abort::Internal(err) => {
                tracing::error!(calendar_id = %calendar.id, user_id = %calendar.user_id, "sync pass aborted: {}", err);
                let error = SyncError::new(SyncErrorKind::Internal, err.to_string());
                state.last_error = Some(error.clone());
                state.next_sync_at = Some(after(sync.interval));
                PassOutcome::Failed(error)
            }
            Abort::Cancelled => PassOutcome::Cancelled,
        }
    }
}

impl PassOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, PassOutcome::Committed(_))
    }
}

/// `now + delay`, saturating at the largest representable instant.
fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
