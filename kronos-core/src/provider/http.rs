//! Shared HTTP plumbing: client construction and status classification.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{KronosError, KronosResult, ProviderError};

pub(crate) fn client(timeout: Duration) -> KronosResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("kronos/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| KronosError::Config(format!("Failed to create HTTP client: {e}")))
}

/// `base` with `segments` appended as percent-encoded path segments.
pub(crate) fn endpoint(base: &str, segments: &[&str]) -> Result<Url, ProviderError> {
    let mut url = Url::parse(base)
        .map_err(|e| ProviderError::Transient(format!("invalid base url {base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| ProviderError::Transient(format!("base url {base} cannot take a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Send a request and decode a successful JSON body.
pub(crate) async fn get_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ProviderError> {
    let response = request.send().await.map_err(transport_error)?;
    let response = check_status(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| ProviderError::Transient(format!("undecodable response body: {e}")))
}

/// Send a request whose body is not needed. Statuses in `accepted` are
/// returned rather than classified as failures.
pub(crate) async fn send(request: RequestBuilder, accepted: &[StatusCode]) -> Result<StatusCode, ProviderError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if accepted.contains(&status) {
        return Ok(status);
    }
    check_status(response).await.map(|r| r.status())
}

async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = retry_after(response.headers(), Utc::now());
    let body = response.text().await.unwrap_or_default();
    Err(classify(status, retry_after, &body))
}

pub(crate) fn classify(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let detail = format!("{status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::AuthExpired(detail),
        StatusCode::GONE => ProviderError::FullResyncRequired,
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        _ => ProviderError::Transient(detail),
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Transient("request timed out".to_string())
    } else {
        ProviderError::Transient(format!("request failed: {err}"))
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub(crate) fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_statuses() {
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, None, ""),
            ProviderError::AuthExpired(_)
        ));
        assert_eq!(
            classify(StatusCode::GONE, None, "sync token expired"),
            ProviderError::FullResyncRequired
        );
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(9)), ""),
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(9))
            }
        );
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, None, ""),
            ProviderError::Transient(_)
        ));
    }

    #[test]
    fn test_retry_after_forms() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));
        assert_eq!(retry_after(&headers, now), Some(Duration::from_secs(120)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers, now), Some(Duration::from_secs(60)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers, now), None);
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let url = endpoint("https://api.example.com/v3/", &["calendars", "me@x.com", "events"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v3/calendars/me@x.com/events");

        let url = endpoint("https://api.example.com/v3", &["calendars", "a/b"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v3/calendars/a%2Fb");
    }
}
