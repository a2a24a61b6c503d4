//! Engine configuration.
//!
//! Layered: built-in defaults, then an optional TOML file
//! (`$KRONOS_CONFIG` or `~/.config/kronos/config.toml`), then `KRONOS__*`
//! environment variables (`KRONOS__SYNC__INTERVAL=1m`).
//! Durations are human strings such as `"30s"` or `"5m"`.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer};

use crate::constants::*;
use crate::error::{KronosError, KronosResult};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sync: SyncConfig,
    pub expansion: ExpansionConfig,
    pub merge: MergeConfig,
    pub providers: ProvidersConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    #[serde(deserialize_with = "human_duration")]
    pub interval: Duration,
    pub failure_threshold: u32,
    #[serde(deserialize_with = "human_duration")]
    pub fetch_timeout: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub lock_timeout: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub backoff_base: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub backoff_cap: Duration,
    pub max_concurrent_passes: usize,
    #[serde(deserialize_with = "human_duration")]
    pub rewindow_after: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub requeue_delay: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub tick: Duration,
    /// Push busy blocks to the user's writable calendars after each committed pass.
    pub busy_blocks: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            backoff_base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            backoff_cap: Duration::from_secs(DEFAULT_BACKOFF_CAP_SECS),
            max_concurrent_passes: DEFAULT_MAX_CONCURRENT_PASSES,
            rewindow_after: Duration::from_secs(DEFAULT_REWINDOW_AFTER_SECS),
            requeue_delay: Duration::from_secs(DEFAULT_REQUEUE_DELAY_SECS),
            tick: Duration::from_secs(DEFAULT_SCHEDULER_TICK_SECS),
            busy_blocks: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    pub past_days: i64,
    pub future_days: i64,
    pub max_occurrences: u16,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        ExpansionConfig {
            past_days: DEFAULT_EXPANSION_PAST_DAYS,
            future_days: DEFAULT_EXPANSION_FUTURE_DAYS,
            max_occurrences: DEFAULT_MAX_OCCURRENCES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    #[serde(deserialize_with = "human_duration")]
    pub tolerance: Duration,
    pub threshold: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            tolerance: Duration::from_secs(DEFAULT_MERGE_TOLERANCE_SECS as u64),
            threshold: DEFAULT_MERGE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub google_base_url: String,
    pub microsoft_base_url: String,
    pub caldotcom_base_url: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        ProvidersConfig {
            google_base_url: "https://www.googleapis.com/calendar/v3".to_string(),
            microsoft_base_url: "https://graph.microsoft.com/v1.0".to_string(),
            caldotcom_base_url: "https://api.cal.com/v2".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

fn human_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

impl EngineConfig {
    /// `$KRONOS_CONFIG`, else `kronos/config.toml` under the user config dir.
    pub fn config_path() -> KronosResult<PathBuf> {
        if let Some(path) = std::env::var_os("KRONOS_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| KronosError::Config("Could not determine config directory".into()))?;
        Ok(config_dir.join("kronos").join("config.toml"))
    }

    pub fn load() -> KronosResult<Self> {
        Self::load_from(Self::config_path()?)
    }

    pub fn load_from(path: PathBuf) -> KronosResult<Self> {
        let config: EngineConfig = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("KRONOS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| KronosError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| KronosError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> KronosResult<()> {
        if !(0.0..=1.0).contains(&self.merge.threshold) {
            return Err(KronosError::Config(format!(
                "merge.threshold must be within 0..=1, got {}",
                self.merge.threshold
            )));
        }
        if self.sync.failure_threshold == 0 {
            return Err(KronosError::Config("sync.failure_threshold must be at least 1".into()));
        }
        if self.sync.max_concurrent_passes == 0 {
            return Err(KronosError::Config(
                "sync.max_concurrent_passes must be at least 1".into(),
            ));
        }
        if self.sync.backoff_base > self.sync.backoff_cap {
            return Err(KronosError::Config("sync.backoff_base exceeds sync.backoff_cap".into()));
        }
        Ok(())
    }

    /// Merge tolerance as a signed chrono duration.
    pub fn merge_tolerance(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.merge.tolerance)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_MERGE_TOLERANCE_SECS))
    }
}
