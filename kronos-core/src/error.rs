//! Error types for the kronos engine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in engine operations.
#[derive(Error, Debug)]
pub enum KronosError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Calendar not found: {0}")]
    CalendarNotFound(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    /// Lock timeout or store-level failure while committing a pass.
    #[error("Commit conflict: {0}")]
    CommitConflict(String),

    /// A broken internal invariant. Fatal for the affected user's pass only.
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

/// Result type alias for engine operations.
pub type KronosResult<T> = Result<T, KronosError>;

/// Failures surfaced by a provider adapter for a whole fetch.
///
/// Malformed individual records are not errors at this level: adapters skip
/// them and report the count in the returned delta.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider credentials expired or revoked: {0}")]
    AuthExpired(String),

    #[error("Provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient provider failure: {0}")]
    Transient(String),

    /// The provider no longer accepts the stored cursor.
    #[error("Provider invalidated the sync cursor")]
    FullResyncRequired,

    /// The adapter has no write path for this operation.
    #[error("Provider does not support {0}")]
    Unsupported(&'static str),
}

/// Classification of the error last recorded on a calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    AuthExpired,
    RateLimited,
    Transient,
    CommitConflict,
    Internal,
}

/// The `last-error` value stored on a calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub message: String,
    /// When the next retry is scheduled, if one is.
    pub retry_at: Option<DateTime<Utc>>,
}

impl SyncError {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        SyncError {
            kind,
            message: message.into(),
            retry_at: None,
        }
    }

    pub fn with_retry_at(mut self, retry_at: DateTime<Utc>) -> Self {
        self.retry_at = Some(retry_at);
        self
    }

    /// Whether the orchestrator retries this failure on its own.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, SyncErrorKind::AuthExpired)
    }
}

impl From<&ProviderError> for SyncErrorKind {
    fn from(err: &ProviderError) -> Self {
        match err {
            ProviderError::AuthExpired(_) => SyncErrorKind::AuthExpired,
            ProviderError::RateLimited { .. } => SyncErrorKind::RateLimited,
            ProviderError::Transient(_) | ProviderError::FullResyncRequired => {
                SyncErrorKind::Transient
            }
            ProviderError::Unsupported(_) => SyncErrorKind::Internal,
        }
    }
}
