//! Cal.com bookings.
//!
//! No change feed: every fetch lists all bookings in the window and the
//! result replaces whatever was stored for the calendar.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use super::http::{endpoint, get_json};
use super::{Capabilities, ProviderAdapter, item_id};
use crate::calendar::{Calendar, ProviderKind};
use crate::date_range::DateRange;
use crate::error::ProviderError;
use crate::event::EventStatus;
use crate::raw::{Delta, EventTime, RawEventRecord};
use crate::store::AccessToken;

const API_VERSION: &str = "2024-08-13";
const PAGE_SIZE: usize = 100;

pub struct CalDotComAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl CalDotComAdapter {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        CalDotComAdapter { client, base_url }
    }
}

#[derive(Debug, Deserialize)]
struct BookingsPage {
    #[serde(default)]
    data: Vec<serde_json::Value>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    #[serde(default)]
    has_next_page: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Booking {
    uid: String,
    title: String,
    description: Option<String>,
    location: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    status: String,
    attendees: Vec<BookingAttendee>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BookingAttendee {
    email: String,
}

#[async_trait]
impl ProviderAdapter for CalDotComAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CalDotCom
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            incremental: false,
            push: true,
            busy_blocks: false,
        }
    }

    async fn fetch_delta(
        &self,
        calendar: &Calendar,
        _cursor: Option<&str>,
        window: &DateRange,
        token: &AccessToken,
    ) -> Result<Delta, ProviderError> {
        let url = endpoint(&self.base_url, &["bookings"])?;
        let mut delta = Delta {
            complete: true,
            ..Default::default()
        };
        let mut skip = 0usize;

        loop {
            let mut request = self
                .client
                .get(url.clone())
                .bearer_auth(token.secret())
                .header("cal-api-version", API_VERSION)
                .query(&[("take", PAGE_SIZE), ("skip", skip)]);
            if let Some(from) = window.from {
                request = request.query(&[("afterStart", from.to_rfc3339_opts(SecondsFormat::Secs, true))]);
            }
            if let Some(to) = window.to {
                request = request.query(&[("beforeEnd", to.to_rfc3339_opts(SecondsFormat::Secs, true))]);
            }

            let page: BookingsPage = get_json(request).await?;
            let count = page.data.len();
            for value in page.data {
                let id = item_id(&value, "uid");
                match parse_booking(value) {
                    Ok(Some(record)) => delta.records.push(record),
                    Ok(None) => {}
                    Err(reason) => {
                        tracing::warn!(calendar_id = %calendar.id, "skipping Cal.com booking: {}", reason);
                        delta.skip(id);
                    }
                }
            }

            let more = page.pagination.map_or(count == PAGE_SIZE, |p| p.has_next_page);
            if !more || count == 0 {
                break;
            }
            skip += count;
        }

        Ok(delta)
    }
}

/// `Ok(None)` for bookings that no longer hold time.
fn parse_booking(value: serde_json::Value) -> Result<Option<RawEventRecord>, String> {
    let booking: Booking =
        serde_json::from_value(value).map_err(|e| format!("undecodable booking: {e}"))?;
    if booking.uid.is_empty() {
        return Err("booking has no uid".to_string());
    }

    let status = match booking.status.as_str() {
        "cancelled" | "rejected" => return Ok(None),
        "pending" | "unconfirmed" => EventStatus::Tentative,
        _ => EventStatus::Confirmed,
    };
    let start = booking.start.ok_or("booking has no start")?;
    let end = booking.end.ok_or("booking has no end")?;

    // Bookings carry no etag; the last update instant serves as one.
    let revision = booking
        .updated_at
        .map(|u| u.to_rfc3339())
        .unwrap_or_else(|| format!("{}:{}", start.to_rfc3339(), end.to_rfc3339()));

    let mut record = RawEventRecord::new(
        &booking.uid,
        &revision,
        &booking.title,
        EventTime::DateTimeUtc(start),
        EventTime::DateTimeUtc(end),
    );
    record.description = booking.description.filter(|d| !d.is_empty());
    record.location = booking.location.filter(|l| !l.is_empty());
    record.status = status;
    record.attendees = booking
        .attendees
        .into_iter()
        .map(|a| a.email)
        .filter(|e| !e.is_empty())
        .collect();
    record.updated = booking.updated_at;

    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepted_booking() {
        let record = parse_booking(json!({
            "id": 991,
            "uid": "bk_8f2a",
            "title": "Intro call between Ann and Bo",
            "start": "2025-03-20T10:00:00.000Z",
            "end": "2025-03-20T10:30:00.000Z",
            "status": "accepted",
            "attendees": [{ "name": "Bo", "email": "bo@x.com", "timeZone": "Europe/Paris" }],
            "updatedAt": "2025-03-18T08:00:00.000Z",
            "eventTypeId": 12
        }))
        .unwrap()
        .unwrap();

        assert_eq!(record.provider_event_id, "bk_8f2a");
        assert_eq!(record.revision, "2025-03-18T08:00:00+00:00");
        assert_eq!(record.attendees, vec!["bo@x.com".to_string()]);
        assert_eq!(record.status, EventStatus::Confirmed);
    }

    #[test]
    fn test_cancelled_booking_dropped() {
        let record = parse_booking(json!({
            "uid": "bk_1",
            "status": "cancelled",
            "start": "2025-03-20T10:00:00Z",
            "end": "2025-03-20T10:30:00Z"
        }))
        .unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn test_pending_is_tentative() {
        let record = parse_booking(json!({
            "uid": "bk_2",
            "status": "pending",
            "start": "2025-03-20T10:00:00Z",
            "end": "2025-03-20T10:30:00Z"
        }))
        .unwrap()
        .unwrap();
        assert_eq!(record.status, EventStatus::Tentative);
        assert_eq!(record.revision, "2025-03-20T10:00:00+00:00:2025-03-20T10:30:00+00:00");
    }

    #[test]
    fn test_booking_without_times_is_error() {
        assert!(parse_booking(json!({ "uid": "bk_3", "status": "accepted" })).is_err());
    }
}
