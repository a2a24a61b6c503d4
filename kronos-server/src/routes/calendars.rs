//! Calendar registration and sync triggers

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
};
use kronos_core::store::AccessToken;
use kronos_core::{Calendar, CalendarId, CalendarSummary, ProviderKind, UserId};
use serde::Deserialize;
use uuid::Uuid;

use crate::routes::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/calendars", post(register_calendar))
        .route("/api/calendars/{id}/sync", post(trigger_sync))
        .route("/api/calendars/{id}/deactivate", post(deactivate))
        .route("/api/webhooks/{id}", post(webhook))
}

/// Request body sent by the onboarding collaborator once OAuth is done
#[derive(Deserialize)]
pub struct RegisterCalendarRequest {
    pub user_id: UserId,
    pub provider: ProviderKind,
    pub external_account: String,
    pub name: Option<String>,
    pub timezone: Option<String>,
    pub access_token: String,
}

/// POST /api/calendars - Register a connected calendar and queue its first pass
async fn register_calendar(
    State(state): State<AppState>,
    Json(req): Json<RegisterCalendarRequest>,
) -> Result<(StatusCode, Json<CalendarSummary>), AppError> {
    let mut calendar = Calendar::new(
        Uuid::new_v4(),
        req.user_id,
        req.provider,
        &req.external_account,
        req.timezone.as_deref().unwrap_or("UTC"),
    );
    if let Some(name) = req.name {
        calendar.name = name;
    }

    state.engine.add_calendar(calendar.clone()).await?;
    state.credentials.insert(calendar.id, AccessToken::new(req.access_token));
    state.engine.trigger_sync(calendar.id).await?;

    Ok((StatusCode::CREATED, Json(CalendarSummary::from(&calendar))))
}

/// POST /api/calendars/:id/sync - Queue an out-of-cycle pass
async fn trigger_sync(
    State(state): State<AppState>,
    Path(id): Path<CalendarId>,
) -> Result<StatusCode, AppError> {
    state.engine.trigger_sync(id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/calendars/:id/deactivate - Access revoked; stop syncing, keep events
async fn deactivate(
    State(state): State<AppState>,
    Path(id): Path<CalendarId>,
) -> Result<StatusCode, AppError> {
    state.engine.deactivate(id).await?;
    state.credentials.revoke(id);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/webhooks/:id - Provider push notification.
///
/// The payload is ignored: a push only shortens latency, the pass fetches
/// whatever changed since the calendar's cursor.
async fn webhook(State(state): State<AppState>, Path(id): Path<CalendarId>) -> Result<StatusCode, AppError> {
    tracing::debug!(calendar_id = %id, "push notification received");
    state.engine.trigger_sync(id).await?;
    Ok(StatusCode::ACCEPTED)
}
