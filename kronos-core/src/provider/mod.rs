//! Provider adapters: fetch raw deltas from each calendar service.
//!
//! Adapters are stateless apart from the cursor passed in and out. A fetch
//! either returns a [`Delta`] or fails as a whole with a [`ProviderError`];
//! individual malformed records are skipped and counted, never fatal.
//!
//! Adapters that can write also accept busy blocks: opaque placeholders that
//! hold time in one calendar for an event that lives in another.

mod caldotcom;
mod google;
mod http;
mod microsoft;

pub use caldotcom::CalDotComAdapter;
pub use google::GoogleAdapter;
pub use microsoft::MicrosoftAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::calendar::{Calendar, ProviderKind};
use crate::config::ProvidersConfig;
use crate::constants::BUSY_BLOCK_TITLE;
use crate::date_range::DateRange;
use crate::error::{KronosResult, ProviderError};
use crate::event::{CalendarId, Event, EventId};
use crate::raw::Delta;
use crate::store::AccessToken;

/// What a provider's API can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Deltas since a cursor. Without it every fetch is a complete set.
    pub incremental: bool,
    /// The provider can notify us of changes (webhooks).
    pub push: bool,
    /// The adapter writes busy blocks.
    pub busy_blocks: bool,
}

/// Time held in one calendar for an event from another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyBlock {
    /// Derived from the target calendar and source event, so pushing the
    /// same block twice updates it in place. Lowercase hex, which every
    /// provider accepts as a client-chosen id.
    pub id: String,
    pub source_event_id: EventId,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BusyBlock {
    pub fn for_event(target: CalendarId, event: &Event) -> Self {
        BusyBlock {
            id: Uuid::new_v5(&target, event.id.as_bytes()).simple().to_string(),
            source_event_id: event.id,
            title: BUSY_BLOCK_TITLE.to_string(),
            start: event.start,
            end: event.end,
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities;

    /// Fetch changes since `cursor`, or everything when it is None.
    ///
    /// `window` bounds providers that require an explicit time range; series
    /// masters are still returned whole.
    async fn fetch_delta(
        &self,
        calendar: &Calendar,
        cursor: Option<&str>,
        window: &DateRange,
        token: &AccessToken,
    ) -> Result<Delta, ProviderError>;

    /// Create or update a busy block. Blocks must not come back from
    /// `fetch_delta`.
    async fn upsert_busy_block(
        &self,
        _calendar: &Calendar,
        _block: &BusyBlock,
        _token: &AccessToken,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("busy blocks"))
    }

    /// Remove a busy block. One that is already gone counts as removed.
    async fn delete_busy_block(
        &self,
        _calendar: &Calendar,
        _block_id: &str,
        _token: &AccessToken,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("busy blocks"))
    }
}

/// The string id of a raw item, read before decoding so a malformed item can
/// still be named.
fn item_id(value: &serde_json::Value, field: &str) -> Option<String> {
    value
        .get(field)?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Adapters by provider kind.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The three built-in HTTP adapters sharing one client.
    pub fn http(config: &ProvidersConfig, fetch_timeout: std::time::Duration) -> KronosResult<Self> {
        let client = http::client(fetch_timeout)?;
        let mut registry = Self::new();
        registry.register(Arc::new(GoogleAdapter::new(client.clone(), config.google_base_url.clone())));
        registry.register(Arc::new(MicrosoftAdapter::new(
            client.clone(),
            config.microsoft_base_url.clone(),
        )));
        registry.register(Arc::new(CalDotComAdapter::new(client, config.caldotcom_base_url.clone())));
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned()
    }
}
