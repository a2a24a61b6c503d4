//! Access tokens for provider calls.

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::ProviderError;
use crate::event::CalendarId;

/// Bearer token for one calendar's provider account.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        AccessToken(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Supplies valid tokens, refreshing them transparently.
///
/// Returns [`ProviderError::AuthExpired`] when the grant can no longer be
/// refreshed and the user must re-authorize.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn valid_token(&self, calendar_id: CalendarId) -> Result<AccessToken, ProviderError>;
}

/// Fixed tokens registered up front, for the bundled server and tests.
#[derive(Default)]
pub struct StaticCredentials {
    tokens: DashMap<CalendarId, AccessToken>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, calendar_id: CalendarId, token: AccessToken) {
        self.tokens.insert(calendar_id, token);
    }

    pub fn revoke(&self, calendar_id: CalendarId) {
        self.tokens.remove(&calendar_id);
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn valid_token(&self, calendar_id: CalendarId) -> Result<AccessToken, ProviderError> {
        self.tokens
            .get(&calendar_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| ProviderError::AuthExpired(format!("no token for calendar {calendar_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_missing_token_is_auth_expired() {
        let creds = StaticCredentials::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            creds.valid_token(id).await,
            Err(ProviderError::AuthExpired(_))
        ));

        creds.insert(id, AccessToken::new("t0k"));
        assert_eq!(creds.valid_token(id).await.unwrap().secret(), "t0k");

        creds.revoke(id);
        assert!(creds.valid_token(id).await.is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        assert_eq!(format!("{:?}", AccessToken::new("hunter2")), "AccessToken(***)");
    }
}
