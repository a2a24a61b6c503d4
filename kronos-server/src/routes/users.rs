//! Per-user endpoints: timeline, conflicts, calendars and sync status, plus
//! event tagging and busy-block pushes.
//!
//! All reads go against the last committed snapshot and never wait on a pass.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
};
use kronos_core::{
    BusyBlockReport, CalendarSummary, ConflictGroup, DateRange, Event, EventId, SyncStatus, UserId,
};
use serde::Deserialize;

use crate::routes::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/users/{user_id}/events", get(list_events))
        .route("/api/users/{user_id}/conflicts", get(list_conflicts))
        .route("/api/users/{user_id}/calendars", get(list_calendars))
        .route("/api/users/{user_id}/status", get(status))
        .route("/api/users/{user_id}/events/{event_id}/client-tag", put(set_client_tag))
        .route("/api/users/{user_id}/busy-blocks", post(push_busy_blocks))
}

/// Optional time bounds: `YYYY-MM-DD` or RFC3339.
#[derive(Deserialize)]
pub struct RangeQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

/// GET /api/users/:user_id/events - Live events ordered by start
async fn list_events(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<Event>>, AppError> {
    let range = DateRange::from_args(query.from.as_deref(), query.to.as_deref())?;
    Ok(Json(state.engine.events(user_id, &range).await?))
}

/// GET /api/users/:user_id/conflicts
async fn list_conflicts(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<Vec<ConflictGroup>>, AppError> {
    Ok(Json(state.engine.conflicts(user_id).await?))
}

/// GET /api/users/:user_id/calendars - Status only, never cursors or tokens
async fn list_calendars(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<Vec<CalendarSummary>>, AppError> {
    Ok(Json(state.engine.calendars(user_id).await?))
}

#[derive(Deserialize)]
pub struct ClientTagRequest {
    pub client_tag: Option<String>,
}

/// PUT /api/users/:user_id/events/:event_id/client-tag - null clears the tag
async fn set_client_tag(
    State(state): State<AppState>,
    Path((user_id, event_id)): Path<(UserId, EventId)>,
    Json(req): Json<ClientTagRequest>,
) -> Result<StatusCode, AppError> {
    state.engine.set_client_tag(user_id, event_id, req.client_tag).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/users/:user_id/busy-blocks
async fn push_busy_blocks(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<BusyBlockReport>, AppError> {
    Ok(Json(state.engine.push_busy_blocks(user_id).await?))
}

async fn status(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<SyncStatus>, AppError> {
    Ok(Json(state.engine.sync_status(user_id).await?))
}
