use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a calendar's sync pass currently is.
///
/// A pass walks `Idle -> Fetching -> Normalizing -> Merging -> Committing`
/// and back to `Idle`. Any step can drop to `Failed`; `Deactivated` follows
/// an auth failure or too many consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Fetching,
    Normalizing,
    Merging,
    Committing,
    Failed,
    Deactivated,
}

impl SyncPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Normalizing => "normalizing",
            SyncPhase::Merging => "merging",
            SyncPhase::Committing => "committing",
            SyncPhase::Failed => "failed",
            SyncPhase::Deactivated => "deactivated",
        }
    }

    /// A pass is running.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SyncPhase::Fetching | SyncPhase::Normalizing | SyncPhase::Merging | SyncPhase::Committing
        )
    }

    pub fn can_transition_to(&self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        match (self, next) {
            (_, Failed) => *self != Deactivated,
            (Idle | Failed, Fetching) => true,
            (Fetching, Normalizing) | (Normalizing, Merging) | (Merging, Committing) => true,
            (Committing, Idle) => true,
            // A deactivation observed mid-pass, an auth failure, or a collaborator.
            (_, Deactivated) => true,
            (Failed, Idle) => true,
            (Deactivated, Fetching) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}
