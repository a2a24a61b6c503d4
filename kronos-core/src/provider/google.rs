//! Google Calendar v3 events API.
//!
//! Incremental via `syncToken`. Series come back as masters plus modified
//! instances (`singleEvents=false`); we expand masters ourselves.
//!
//! Busy blocks are written with a client-chosen id and tagged with a private
//! extended property, which is how fetches recognize and drop them.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::http::{endpoint, get_json, send};
use super::{BusyBlock, Capabilities, ProviderAdapter, item_id};
use crate::calendar::{Calendar, ProviderKind};
use crate::date_range::DateRange;
use crate::error::ProviderError;
use crate::event::{EventStatus, Transparency};
use crate::raw::{Delta, EventTime, RawEventRecord, Recurrence};
use crate::store::AccessToken;

const PAGE_SIZE: &str = "250";

/// Private extended property naming the event a busy block stands in for.
const BUSY_BLOCK_PROPERTY: &str = "kronosBusyFor";

pub struct GoogleAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl GoogleAdapter {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        GoogleAdapter { client, base_url }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsPage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GoogleEvent {
    id: String,
    etag: String,
    status: String,
    summary: String,
    description: Option<String>,
    location: Option<String>,
    start: Option<GoogleTime>,
    end: Option<GoogleTime>,
    recurrence: Vec<String>,
    recurring_event_id: Option<String>,
    original_start_time: Option<GoogleTime>,
    attendees: Vec<GoogleAttendee>,
    transparency: String,
    updated: Option<DateTime<Utc>>,
    extended_properties: Option<ExtendedProperties>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExtendedProperties {
    private: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GoogleTime {
    date: Option<NaiveDate>,
    date_time: Option<DateTime<FixedOffset>>,
    time_zone: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GoogleAttendee {
    email: String,
    resource: bool,
}

/// What one Google item means for the delta.
#[derive(Debug)]
enum Item {
    Record(RawEventRecord),
    Removed(String),
    /// A busy block we wrote ourselves.
    BusyBlock,
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleCalendar
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            incremental: true,
            push: true,
            busy_blocks: true,
        }
    }

    async fn fetch_delta(
        &self,
        calendar: &Calendar,
        cursor: Option<&str>,
        _window: &DateRange,
        token: &AccessToken,
    ) -> Result<Delta, ProviderError> {
        let url = endpoint(&self.base_url, &["calendars", &calendar.external_account, "events"])?;
        let mut delta = Delta {
            complete: cursor.is_none(),
            ..Default::default()
        };
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(url.clone())
                .bearer_auth(token.secret())
                .query(&[("singleEvents", "false"), ("showDeleted", "true"), ("maxResults", PAGE_SIZE)]);
            if let Some(cursor) = cursor {
                request = request.query(&[("syncToken", cursor)]);
            }
            if let Some(page) = page_token.as_deref() {
                request = request.query(&[("pageToken", page)]);
            }

            let page: EventsPage = get_json(request).await?;
            for value in page.items {
                let id = item_id(&value, "id");
                match parse_item(value) {
                    Ok(Item::Record(record)) => delta.records.push(record),
                    Ok(Item::Removed(id)) => delta.removed.push(id),
                    Ok(Item::BusyBlock) => {}
                    Err(reason) => {
                        tracing::warn!(calendar_id = %calendar.id, "skipping Google item: {}", reason);
                        delta.skip(id);
                    }
                }
            }

            match (page.next_page_token, page.next_sync_token) {
                (Some(next), _) => page_token = Some(next),
                (None, sync_token) => {
                    delta.next_cursor = sync_token.or_else(|| cursor.map(str::to_string));
                    break;
                }
            }
        }

        Ok(delta)
    }

    async fn upsert_busy_block(
        &self,
        calendar: &Calendar,
        block: &BusyBlock,
        token: &AccessToken,
    ) -> Result<(), ProviderError> {
        let body = busy_block_body(block);
        let url = endpoint(&self.base_url, &["calendars", &calendar.external_account, "events", &block.id])?;
        let status = send(
            self.client.put(url).bearer_auth(token.secret()).json(&body),
            &[StatusCode::NOT_FOUND],
        )
        .await?;
        if status == StatusCode::NOT_FOUND {
            let url = endpoint(&self.base_url, &["calendars", &calendar.external_account, "events"])?;
            send(self.client.post(url).bearer_auth(token.secret()).json(&body), &[]).await?;
        }
        Ok(())
    }

    async fn delete_busy_block(
        &self,
        calendar: &Calendar,
        block_id: &str,
        token: &AccessToken,
    ) -> Result<(), ProviderError> {
        let url = endpoint(&self.base_url, &["calendars", &calendar.external_account, "events", block_id])?;
        // Google answers 410 for an event that was already deleted.
        send(
            self.client.delete(url).bearer_auth(token.secret()),
            &[StatusCode::NOT_FOUND, StatusCode::GONE],
        )
        .await?;
        Ok(())
    }
}

fn busy_block_body(block: &BusyBlock) -> serde_json::Value {
    let time = |at: DateTime<Utc>| json!({ "dateTime": at.to_rfc3339_opts(SecondsFormat::Secs, true) });
    json!({
        "id": block.id,
        "summary": block.title,
        "start": time(block.start),
        "end": time(block.end),
        "transparency": "opaque",
        "visibility": "private",
        "reminders": { "useDefault": false },
        "extendedProperties": {
            "private": { BUSY_BLOCK_PROPERTY: block.source_event_id.to_string() }
        }
    })
}

fn parse_item(value: serde_json::Value) -> Result<Item, String> {
    let event: GoogleEvent =
        serde_json::from_value(value).map_err(|e| format!("undecodable item: {e}"))?;
    from_google(event)
}

fn from_google(event: GoogleEvent) -> Result<Item, String> {
    if event.id.is_empty() {
        return Err("item has no id".to_string());
    }
    let busy_block = event
        .extended_properties
        .as_ref()
        .is_some_and(|p| p.private.contains_key(BUSY_BLOCK_PROPERTY));
    if busy_block {
        return Ok(Item::BusyBlock);
    }

    let original_start = event.original_start_time.as_ref().map(event_time).transpose()?;

    if event.status == "cancelled" {
        // A cancelled instance of a series arrives with only its original slot.
        return match (event.recurring_event_id, original_start) {
            (Some(series), Some(slot)) => {
                let mut record = RawEventRecord::new(&event.id, &event.etag, "", slot.clone(), slot.clone());
                record.status = EventStatus::Cancelled;
                record.recurring_event_id = Some(series);
                record.original_start = Some(slot);
                Ok(Item::Record(record))
            }
            _ => Ok(Item::Removed(event.id)),
        };
    }

    let start = event
        .start
        .as_ref()
        .map(event_time)
        .transpose()?
        .ok_or("item has no start")?;
    let end = event
        .end
        .as_ref()
        .map(event_time)
        .transpose()?
        .ok_or("item has no end")?;

    let revision = if event.etag.is_empty() {
        event.updated.map(|u| u.to_rfc3339()).unwrap_or_default()
    } else {
        event.etag
    };

    let mut record = RawEventRecord::new(&event.id, &revision, &event.summary, start, end);
    record.description = event.description.filter(|d| !d.is_empty());
    record.location = event.location.filter(|l| !l.is_empty());
    record.recurrence = parse_recurrence(&event.recurrence);
    record.recurring_event_id = event.recurring_event_id;
    record.original_start = original_start;
    record.attendees = event
        .attendees
        .into_iter()
        .filter(|a| !a.resource && !a.email.is_empty())
        .map(|a| a.email)
        .collect();
    record.status = match event.status.as_str() {
        "tentative" => EventStatus::Tentative,
        _ => EventStatus::Confirmed,
    };
    record.transparency = if event.transparency == "transparent" {
        Transparency::Transparent
    } else {
        Transparency::Opaque
    };
    record.updated = event.updated;

    Ok(Item::Record(record))
}

fn event_time(time: &GoogleTime) -> Result<EventTime, String> {
    match (time.date_time, time.date, time.time_zone.as_deref()) {
        (Some(dt), _, Some(tz)) => Ok(EventTime::DateTimeZoned {
            datetime: dt.naive_local(),
            tzid: tz.to_string(),
        }),
        (Some(dt), _, None) => Ok(EventTime::DateTimeUtc(dt.with_timezone(&Utc))),
        (None, Some(d), _) => Ok(EventTime::Date(d)),
        (None, None, _) => Err("time has neither date nor dateTime".to_string()),
    }
}

/// Google returns recurrence as iCalendar lines:
/// - `"RRULE:FREQ=WEEKLY;BYDAY=MO"`
/// - `"EXDATE;TZID=America/New_York:20240108T100000"`
/// - `"EXDATE:20240108T100000Z"`
fn parse_recurrence(entries: &[String]) -> Option<Recurrence> {
    let rrule = entries.iter().find_map(|s| s.strip_prefix("RRULE:"))?.to_string();

    let exdates = entries
        .iter()
        .filter_map(|s| s.strip_prefix("EXDATE"))
        .filter_map(|rest| {
            let (params, values) = rest.split_once(':')?;
            let params: Vec<&str> = params.split(';').filter(|p| !p.is_empty()).collect();
            let tzid = params.iter().find_map(|p| p.strip_prefix("TZID="));
            let is_date = params.contains(&"VALUE=DATE");
            Some(
                values
                    .split(',')
                    .filter_map(|v| parse_exdate(v.trim(), tzid, is_date))
                    .collect::<Vec<_>>(),
            )
        })
        .flatten()
        .collect();

    Some(Recurrence { rrule, exdates })
}

fn parse_exdate(value: &str, tzid: Option<&str>, is_date: bool) -> Option<EventTime> {
    if is_date {
        return NaiveDate::parse_from_str(value, "%Y%m%d").ok().map(EventTime::Date);
    }
    let (naive, utc) = match value.strip_suffix('Z') {
        Some(v) => (v, true),
        None => (value, false),
    };
    let datetime = chrono::NaiveDateTime::parse_from_str(naive, "%Y%m%dT%H%M%S").ok()?;
    Some(match (utc, tzid) {
        (true, _) => EventTime::DateTimeUtc(datetime.and_utc()),
        (false, Some(tz)) => EventTime::DateTimeZoned {
            datetime,
            tzid: tz.to_string(),
        },
        (false, None) => EventTime::DateTimeFloating(datetime),
    })
}
