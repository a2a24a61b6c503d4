//! Microsoft Graph calendar view delta.
//!
//! Graph expands series itself, so every record is an instance addressed by
//! its own id. The cursor is the `@odata.deltaLink` URL from the last round.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Deserialize;

use super::http::{endpoint, get_json};
use super::{Capabilities, ProviderAdapter, item_id};
use crate::calendar::{Calendar, ProviderKind};
use crate::date_range::DateRange;
use crate::error::ProviderError;
use crate::event::{EventStatus, Transparency};
use crate::raw::{Delta, EventTime, RawEventRecord};
use crate::store::AccessToken;

pub struct MicrosoftAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl MicrosoftAdapter {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        MicrosoftAdapter { client, base_url }
    }
}

#[derive(Debug, Deserialize)]
struct DeltaPage {
    #[serde(default)]
    value: Vec<serde_json::Value>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GraphEvent {
    id: String,
    change_key: String,
    subject: String,
    body_preview: Option<String>,
    location: Option<GraphLocation>,
    start: Option<GraphTime>,
    end: Option<GraphTime>,
    is_all_day: bool,
    is_cancelled: bool,
    series_master_id: Option<String>,
    original_start: Option<DateTime<Utc>>,
    attendees: Vec<GraphAttendee>,
    show_as: String,
    last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GraphLocation {
    display_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GraphTime {
    date_time: String,
    time_zone: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GraphAttendee {
    email_address: GraphEmail,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GraphEmail {
    address: String,
}

#[derive(Debug)]
enum Item {
    Record(RawEventRecord),
    Removed(String),
}

#[async_trait]
impl ProviderAdapter for MicrosoftAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::MicrosoftCalendar
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            incremental: true,
            push: true,
            busy_blocks: false,
        }
    }

    async fn fetch_delta(
        &self,
        calendar: &Calendar,
        cursor: Option<&str>,
        window: &DateRange,
        token: &AccessToken,
    ) -> Result<Delta, ProviderError> {
        let mut delta = Delta {
            complete: cursor.is_none(),
            ..Default::default()
        };

        let mut request = match cursor {
            Some(link) => self.client.get(link),
            None => {
                let url = endpoint(
                    &self.base_url,
                    &["me", "calendars", &calendar.external_account, "calendarView", "delta"],
                )?;
                let (Some(from), Some(to)) = (window.from, window.to) else {
                    return Err(ProviderError::Transient(
                        "calendar view needs a bounded window".to_string(),
                    ));
                };
                self.client.get(url).query(&[
                    ("startDateTime", from.to_rfc3339_opts(SecondsFormat::Secs, true)),
                    ("endDateTime", to.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ])
            }
        };

        loop {
            let page: DeltaPage = get_json(
                request
                    .bearer_auth(token.secret())
                    .header("Prefer", "outlook.timezone=\"UTC\", odata.maxpagesize=100"),
            )
            .await?;

            for value in page.value {
                let id = item_id(&value, "id");
                match parse_item(value) {
                    Ok(Item::Record(record)) => delta.records.push(record),
                    Ok(Item::Removed(id)) => delta.removed.push(id),
                    Err(reason) => {
                        tracing::warn!(calendar_id = %calendar.id, "skipping Graph item: {}", reason);
                        delta.skip(id);
                    }
                }
            }

            match (page.next_link, page.delta_link) {
                (Some(next), _) => request = self.client.get(next),
                (None, Some(delta_link)) => {
                    delta.next_cursor = Some(delta_link);
                    break;
                }
                (None, None) => {
                    return Err(ProviderError::Transient(
                        "delta round ended without a deltaLink".to_string(),
                    ));
                }
            }
        }

        Ok(delta)
    }
}

fn parse_item(value: serde_json::Value) -> Result<Item, String> {
    let event: GraphEvent =
        serde_json::from_value(value).map_err(|e| format!("undecodable item: {e}"))?;
    from_graph(event)
}

fn from_graph(event: GraphEvent) -> Result<Item, String> {
    if event.id.is_empty() {
        return Err("item has no id".to_string());
    }
    if event.removed.is_some() || event.is_cancelled {
        return Ok(Item::Removed(event.id));
    }

    let start = graph_time(event.start.as_ref(), event.is_all_day)?;
    let end = graph_time(event.end.as_ref(), event.is_all_day)?;

    let mut record = RawEventRecord::new(&event.id, &event.change_key, &event.subject, start, end);
    record.instance = true;
    record.description = event.body_preview.filter(|d| !d.is_empty());
    record.location = event
        .location
        .map(|l| l.display_name)
        .filter(|l| !l.is_empty());
    record.recurring_event_id = event.series_master_id;
    record.original_start = event.original_start.map(EventTime::DateTimeUtc);
    record.attendees = event
        .attendees
        .into_iter()
        .map(|a| a.email_address.address)
        .filter(|a| !a.is_empty())
        .collect();
    (record.status, record.transparency) = match event.show_as.as_str() {
        "free" => (EventStatus::Confirmed, Transparency::Transparent),
        "tentative" => (EventStatus::Tentative, Transparency::Opaque),
        _ => (EventStatus::Confirmed, Transparency::Opaque),
    };
    record.updated = event.last_modified_date_time;

    Ok(Item::Record(record))
}

/// Graph times are wall-clock strings with a separate zone name. All-day
/// events span local midnights, so they become dates.
fn graph_time(time: Option<&GraphTime>, all_day: bool) -> Result<EventTime, String> {
    let time = time.ok_or("item has no start or end")?;
    let naive = NaiveDateTime::parse_from_str(&time.date_time, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| format!("bad dateTime {:?}: {e}", time.date_time))?;
    if all_day {
        return Ok(EventTime::Date(naive.date()));
    }
    Ok(match time.time_zone.as_str() {
        "UTC" | "" => EventTime::DateTimeUtc(naive.and_utc()),
        tz => EventTime::DateTimeZoned {
            datetime: naive,
            tzid: tz.to_string(),
        },
    })
}
