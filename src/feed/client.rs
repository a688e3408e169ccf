//! Source feed client
//!
//! Talks to the source platform's activity API over HTTP.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::events::{FeedEvent, RawActivity, normalize_activity, parse_event_timestamp};
use crate::error::AppError;
use crate::metrics::UPSTREAM_REQUESTS_TOTAL;

/// The source platform's activity feed.
///
/// Over-fetching is allowed: the API may return events older than the
/// requested bound, and callers must rely on the delivery ledger for
/// dedup. No ordering is guaranteed either way.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivityFeed: Send + Sync {
    /// Fetch activity for a handle, advisorily bounded by `since`.
    async fn fetch_activity(
        &self,
        source_handle: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FeedEvent>, AppError>;

    /// The source's own last-read position for a handle, if it tracks
    /// one. Used only as a cold-start fallback.
    async fn last_read_position(
        &self,
        source_handle: &str,
    ) -> Result<Option<DateTime<Utc>>, AppError>;
}

/// HTTP implementation of [`ActivityFeed`]
pub struct HttpFeedClient {
    http_client: Arc<reqwest::Client>,
    base_url: String,
    web_base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct LastReadResponse {
    #[serde(default)]
    last_read: Option<String>,
}

impl HttpFeedClient {
    pub fn new(
        http_client: Arc<reqwest::Client>,
        base_url: String,
        web_base_url: String,
        timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            web_base_url,
            timeout,
        }
    }
}

#[async_trait]
impl ActivityFeed for HttpFeedClient {
    async fn fetch_activity(
        &self,
        source_handle: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FeedEvent>, AppError> {
        let mut request = self
            .http_client
            .get(format!("{}/api/activity/{}", self.base_url, source_handle))
            .timeout(self.timeout);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }

        let response = request.send().await.map_err(|e| {
            UPSTREAM_REQUESTS_TOTAL
                .with_label_values(&["source", "error"])
                .inc();
            AppError::SourceUnavailable(format!("activity fetch for {} failed: {}", source_handle, e))
        })?;

        let status = response.status();
        UPSTREAM_REQUESTS_TOTAL
            .with_label_values(&["source", status.as_str()])
            .inc();
        if !status.is_success() {
            return Err(AppError::SourceUnavailable(format!(
                "activity API returned HTTP {} for {}",
                status, source_handle
            )));
        }

        let raw: Vec<RawActivity> = response.json().await.map_err(|e| {
            AppError::SourceUnavailable(format!(
                "activity payload for {} unreadable: {}",
                source_handle, e
            ))
        })?;

        let events = raw
            .iter()
            .filter_map(|activity| normalize_activity(source_handle, activity, &self.web_base_url))
            .collect();

        Ok(events)
    }

    async fn last_read_position(
        &self,
        source_handle: &str,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let response = self
            .http_client
            .get(format!(
                "{}/api/activity/{}/last_read",
                self.base_url, source_handle
            ))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&["source", "error"])
                    .inc();
                AppError::SourceUnavailable(format!(
                    "last-read fetch for {} failed: {}",
                    source_handle, e
                ))
            })?;

        let status = response.status();
        UPSTREAM_REQUESTS_TOTAL
            .with_label_values(&["source", status.as_str()])
            .inc();
        // A source that never tracked this handle answers 404; that is
        // a valid cold start, not an error.
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AppError::SourceUnavailable(format!(
                "last-read API returned HTTP {} for {}",
                status, source_handle
            )));
        }

        let payload: LastReadResponse = response.json().await.map_err(|e| {
            AppError::SourceUnavailable(format!(
                "last-read payload for {} unreadable: {}",
                source_handle, e
            ))
        })?;

        Ok(payload
            .last_read
            .as_deref()
            .and_then(parse_event_timestamp))
    }
}
