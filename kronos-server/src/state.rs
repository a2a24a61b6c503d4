use std::sync::Arc;

use anyhow::Result;
use kronos_core::EngineConfig;
use kronos_core::SyncEngine;
use kronos_core::provider::AdapterRegistry;
use kronos_core::store::{MemoryStore, StaticCredentials};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    // Tokens handed over at registration; refresh is the onboarding side's job.
    pub credentials: Arc<StaticCredentials>,
}

impl AppState {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let adapters = AdapterRegistry::http(&config.providers, config.sync.fetch_timeout)?;
        let store = Arc::new(MemoryStore::new());
        let credentials = Arc::new(StaticCredentials::new());
        let engine = SyncEngine::new(store, credentials.clone(), adapters, config);

        Ok(AppState {
            engine: Arc::new(engine),
            credentials,
        })
    }
}
