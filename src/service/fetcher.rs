//! Event fetcher service
//!
//! Resolves the "since when" question for each account and pulls its
//! unread activity from the source feed. The read cursor (ours) wins
//! over the source's own last-read position (cold-start fallback);
//! with neither, a bounded lookback window keeps a brand-new link from
//! flooding the pipeline with history.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::data::Database;
use crate::error::AppError;
use crate::feed::{ActivityFeed, FeedEvent};
use crate::metrics::EVENTS_FETCHED_TOTAL;

/// Event fetcher service
pub struct FetcherService {
    db: Arc<Database>,
    feed: Arc<dyn ActivityFeed>,
    lookback: chrono::Duration,
    cold_start_max_events: usize,
}

impl FetcherService {
    pub fn new(
        db: Arc<Database>,
        feed: Arc<dyn ActivityFeed>,
        lookback: chrono::Duration,
        cold_start_max_events: usize,
    ) -> Self {
        Self {
            db,
            feed,
            lookback,
            cold_start_max_events,
        }
    }

    /// Fetch unread events for a handle.
    ///
    /// The source may over-fetch (return events older than the bound);
    /// that is fine, the delivery ledger is the dedup authority. On a
    /// true cold start (no cursor anywhere) the result is capped to the
    /// newest `cold_start_max_events`.
    ///
    /// # Errors
    /// `SourceUnavailable` when the feed API cannot be reached; the
    /// caller skips this account for the cycle.
    pub async fn unread_events(&self, source_handle: &str) -> Result<Vec<FeedEvent>, AppError> {
        let (since, cold_start) = self.resolve_since(source_handle).await?;

        let mut events = self.feed.fetch_activity(source_handle, Some(since)).await?;

        if cold_start && events.len() > self.cold_start_max_events {
            let fetched = events.len();
            events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
            events.truncate(self.cold_start_max_events);
            tracing::debug!(
                source_handle = %source_handle,
                fetched = fetched,
                kept = events.len(),
                "Capped cold-start backlog"
            );
        }

        EVENTS_FETCHED_TOTAL.inc_by(events.len() as u64);
        Ok(events)
    }

    async fn resolve_since(
        &self,
        source_handle: &str,
    ) -> Result<(DateTime<Utc>, bool), AppError> {
        if let Some(cursor) = self.db.get_read_cursor(source_handle).await? {
            return Ok((cursor.last_acknowledged_at, false));
        }

        if let Some(position) = self.feed.last_read_position(source_handle).await? {
            return Ok((position, false));
        }

        Ok((Utc::now() - self.lookback, true))
    }

    /// Advance the read cursor for a handle.
    ///
    /// The cursor is monotonic; an older timestamp is a no-op.
    pub async fn acknowledge_through(
        &self,
        source_handle: &str,
        through: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.db
            .advance_read_cursor(source_handle, through, Utc::now())
            .await
    }
}
