//! Busy blocks: each writable calendar holds the time the user's events in
//! other calendars take.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use super::engine::EngineCore;
use crate::calendar::Calendar;
use crate::error::{KronosResult, ProviderError};
use crate::event::{CalendarId, Event, UserId};
use crate::provider::{BusyBlock, ProviderAdapter};

/// What one push did, summed over the user's writable calendars.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusyBlockReport {
    pub calendars: usize,
    pub written: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub failed: usize,
}

impl EngineCore {
    pub(crate) async fn push_busy_blocks(&self, user_id: UserId) -> KronosResult<BusyBlockReport> {
        let now = Utc::now();
        let calendars = self.store.load_calendars(user_id).await?;
        let events: Vec<Event> = self
            .store
            .load_live_events(user_id)
            .await?
            .into_iter()
            .filter(|e| e.blocks_time() && e.end > now)
            .collect();

        let mut report = BusyBlockReport::default();
        for calendar in calendars.iter().filter(|c| c.active) {
            let Some(adapter) = self.adapters.get(calendar.provider) else {
                continue;
            };
            if !adapter.capabilities().busy_blocks {
                continue;
            }
            report.calendars += 1;

            let wanted: HashMap<String, BusyBlock> = events
                .iter()
                .filter(|e| !e.calendars().contains(&calendar.id))
                .map(|e| BusyBlock::for_event(calendar.id, e))
                .map(|block| (block.id.clone(), block))
                .collect();
            self.push_calendar(calendar, adapter.as_ref(), wanted, &mut report).await;
        }

        tracing::info!(
            user_id = %user_id,
            calendars = report.calendars,
            written = report.written,
            removed = report.removed,
            failed = report.failed,
            "busy blocks pushed"
        );
        Ok(report)
    }

    /// Best effort after a committed pass; failures are logged only.
    pub(crate) async fn push_busy_blocks_after(&self, calendar_id: CalendarId) {
        let user_id = match self.store.load_calendar(calendar_id).await {
            Ok(Some(calendar)) => calendar.user_id,
            _ => return,
        };
        if let Err(e) = self.push_busy_blocks(user_id).await {
            tracing::warn!(user_id = %user_id, "could not push busy blocks: {}", e);
        }
    }

    async fn push_calendar(
        &self,
        calendar: &Calendar,
        adapter: &dyn ProviderAdapter,
        wanted: HashMap<String, BusyBlock>,
        report: &mut BusyBlockReport,
    ) {
        let token = match self.credentials.valid_token(calendar.id).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(calendar_id = %calendar.id, "no token for busy blocks: {}", e);
                report.failed += wanted.len();
                return;
            }
        };
        let timeout = self.config.sync.fetch_timeout;
        let now = Utc::now();

        // Never hold a map guard across the provider calls.
        let mut written = self
            .busy_blocks
            .get(&calendar.id)
            .map(|w| w.value().clone())
            .unwrap_or_default();
        written.retain(|_, block| block.end > now);

        for (id, block) in &wanted {
            if written.get(id) == Some(block) {
                report.unchanged += 1;
                continue;
            }
            match bounded(timeout, adapter.upsert_busy_block(calendar, block, &token)).await {
                Ok(()) => {
                    written.insert(id.clone(), block.clone());
                    report.written += 1;
                }
                Err(e) => {
                    tracing::warn!(calendar_id = %calendar.id, block_id = %id, "busy block not written: {}", e);
                    report.failed += 1;
                }
            }
        }

        let stale: Vec<String> = written
            .keys()
            .filter(|id| !wanted.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            match bounded(timeout, adapter.delete_busy_block(calendar, &id, &token)).await {
                Ok(()) => {
                    written.remove(&id);
                    report.removed += 1;
                }
                Err(e) => {
                    tracing::warn!(calendar_id = %calendar.id, block_id = %id, "busy block not removed: {}", e);
                    report.failed += 1;
                }
            }
        }

        self.busy_blocks.insert(calendar.id, written);
    }
}

async fn bounded(
    timeout: Duration,
    call: impl Future<Output = Result<(), ProviderError>>,
) -> Result<(), ProviderError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(ProviderError::Transient(format!("write exceeded {timeout:?}"))))
}
