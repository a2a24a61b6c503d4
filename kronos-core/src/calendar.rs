//! Provider-connected calendars and their sync bookkeeping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{KronosError, KronosResult, SyncError};
use crate::event::{CalendarId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    GoogleCalendar,
    MicrosoftCalendar,
    CalDotCom,
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::GoogleCalendar => "google",
            ProviderKind::MicrosoftCalendar => "microsoft",
            ProviderKind::CalDotCom => "caldotcom",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = KronosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" | "google_calendar" => Ok(ProviderKind::GoogleCalendar),
            "microsoft" | "microsoft_calendar" | "outlook" => Ok(ProviderKind::MicrosoftCalendar),
            "caldotcom" | "cal_dot_com" | "cal.com" => Ok(ProviderKind::CalDotCom),
            other => Err(KronosError::Config(format!("Unknown provider '{other}'"))),
        }
    }
}

/// One provider-connected source of events.
///
/// Created by the onboarding collaborator; the sync orchestrator is the only
/// writer of the sync fields (cursor, timestamps, errors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub id: CalendarId,
    pub user_id: UserId,
    pub provider: ProviderKind,
    /// Account identifier at the provider (e.g. the Google calendar id).
    pub external_account: String,
    pub name: String,
    /// Declared IANA timezone; anchors all-day and floating times.
    pub timezone: String,
    pub sync_cursor: Option<String>,
    pub active: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<SyncError>,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub next_sync_at: Option<DateTime<Utc>>,
    /// "Now" at the time recurring series were last fully expanded.
    pub window_anchor: Option<DateTime<Utc>>,
}

impl Calendar {
    pub fn new(
        id: CalendarId,
        user_id: UserId,
        provider: ProviderKind,
        external_account: &str,
        timezone: &str,
    ) -> Self {
        Calendar {
            id,
            user_id,
            provider,
            external_account: external_account.to_string(),
            name: external_account.to_string(),
            timezone: timezone.to_string(),
            sync_cursor: None,
            active: true,
            last_sync: None,
            last_error: None,
            consecutive_failures: 0,
            next_sync_at: None,
            window_anchor: None,
        }
    }

    /// Parsed declared timezone.
    pub fn tz(&self) -> KronosResult<Tz> {
        self.timezone.parse::<Tz>().map_err(|_| {
            KronosError::Config(format!(
                "Calendar {} declares unknown timezone '{}'",
                self.id, self.timezone
            ))
        })
    }

    /// Whether the periodic scheduler should start a pass now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_sync_at.is_none_or(|at| at <= now)
    }

    pub fn health(&self) -> CalendarHealth {
        if !self.active {
            CalendarHealth::Deactivated
        } else if self.last_error.is_some() {
            CalendarHealth::Degraded
        } else {
            CalendarHealth::Healthy
        }
    }

    /// Apply a sync-state update produced by the orchestrator.
    pub fn apply(&mut self, update: &SyncStateUpdate) {
        self.sync_cursor = update.cursor.clone();
        self.last_sync = update.last_sync;
        self.last_error = update.last_error.clone();
        self.consecutive_failures = update.consecutive_failures;
        self.next_sync_at = update.next_sync_at;
        self.window_anchor = update.window_anchor;
        if update.deactivate {
            self.active = false;
        }
    }

    /// Current sync state, as a base for the next update.
    pub fn sync_state(&self) -> SyncStateUpdate {
        SyncStateUpdate {
            cursor: self.sync_cursor.clone(),
            last_sync: self.last_sync,
            last_error: self.last_error.clone(),
            consecutive_failures: self.consecutive_failures,
            next_sync_at: self.next_sync_at,
            window_anchor: self.window_anchor,
            deactivate: false,
        }
    }
}

impl fmt::Display for Calendar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.provider)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarHealth {
    Healthy,
    /// Active, but the last pass failed.
    Degraded,
    Deactivated,
}

/// Sync fields written by the orchestrator in one store call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncStateUpdate {
    pub cursor: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<SyncError>,
    pub consecutive_failures: u32,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub window_anchor: Option<DateTime<Utc>>,
    /// Deactivate the calendar. An update never reactivates one.
    pub deactivate: bool,
}

/// What collaborators see of a calendar: status only, no cursor or credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarSummary {
    pub id: CalendarId,
    pub user_id: UserId,
    pub provider: ProviderKind,
    pub name: String,
    pub active: bool,
    pub health: CalendarHealth,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<SyncError>,
}

impl From<&Calendar> for CalendarSummary {
    fn from(calendar: &Calendar) -> Self {
        CalendarSummary {
            id: calendar.id,
            user_id: calendar.user_id,
            provider: calendar.provider,
            name: calendar.name.clone(),
            active: calendar.active,
            health: calendar.health(),
            last_sync: calendar.last_sync,
            last_error: calendar.last_error.clone(),
        }
    }
}
