//! Deduplication ledger service
//!
//! Wraps the ledger tables with the relay's retry policy. The advisory
//! pre-filter keeps already-settled events out of the dispatch path;
//! the atomic claim in the database layer remains the authority on who
//! gets to send.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::RelayConfig;
use crate::data::{ClaimOutcome, Database, DeliveryOutcome, LedgerEntry};
use crate::error::AppError;
use crate::feed::FeedEvent;
use crate::metrics::LEDGER_ROWS_PURGED_TOTAL;

/// Result of running a batch of fetched events past the ledger.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    /// Events worth a delivery attempt this cycle
    pub ready: Vec<FeedEvent>,
    /// Events skipped now but owed a future attempt
    pub deferred: usize,
}

enum Disposition {
    Ready,
    Deferred,
    Settled,
}

/// Deduplication ledger service
pub struct LedgerService {
    db: Arc<Database>,
    pending_timeout: chrono::Duration,
    failure_backoff: chrono::Duration,
    max_attempts: i64,
    retention: chrono::Duration,
}

impl LedgerService {
    pub fn new(db: Arc<Database>, relay: &RelayConfig) -> Self {
        Self {
            db,
            pending_timeout: relay.pending_timeout(),
            failure_backoff: relay.failure_backoff(),
            max_attempts: relay.max_attempts,
            retention: relay.retention(),
        }
    }

    /// Partition events by what their ledger row says.
    ///
    /// `ready` holds events worth a delivery attempt now: no row yet, a
    /// stuck pending claim, or a failure past its backoff and under the
    /// attempt cap. `deferred` counts events that are temporarily
    /// ineligible but will need a later attempt (a live claim held
    /// elsewhere, or a failure still inside its backoff); callers must
    /// not advance the read cursor past a cycle that deferred events,
    /// or they can never be re-fetched for retry.
    ///
    /// Advisory only: two overlapping cycles may both see an event as
    /// ready, and the claim decides the winner.
    pub async fn filter_undelivered(
        &self,
        source_handle: &str,
        events: Vec<FeedEvent>,
    ) -> Result<FilterOutcome, AppError> {
        if events.is_empty() {
            return Ok(FilterOutcome::default());
        }

        let ids: Vec<String> = events
            .iter()
            .map(|event| event.source_event_id.clone())
            .collect();
        let entries = self.db.get_ledger_entries(source_handle, &ids).await?;
        let by_id: HashMap<&str, &LedgerEntry> = entries
            .iter()
            .map(|entry| (entry.source_event_id.as_str(), entry))
            .collect();

        let now = Utc::now();
        let mut outcome = FilterOutcome::default();
        for event in events {
            let disposition = match by_id.get(event.source_event_id.as_str()) {
                None => Disposition::Ready,
                Some(entry) => self.disposition(entry, now),
            };
            match disposition {
                Disposition::Ready => outcome.ready.push(event),
                Disposition::Deferred => outcome.deferred += 1,
                Disposition::Settled => {}
            }
        }
        Ok(outcome)
    }

    fn disposition(&self, entry: &LedgerEntry, now: DateTime<Utc>) -> Disposition {
        match DeliveryOutcome::parse(&entry.outcome) {
            Some(DeliveryOutcome::Sent) | Some(DeliveryOutcome::Suppressed) => {
                Disposition::Settled
            }
            Some(DeliveryOutcome::Pending) => {
                // Only a stuck claim is up for grabs again.
                if now - entry.claimed_at > self.pending_timeout {
                    Disposition::Ready
                } else {
                    Disposition::Deferred
                }
            }
            Some(DeliveryOutcome::FailedPermanent) => {
                if entry.attempts >= self.max_attempts {
                    return Disposition::Settled;
                }
                let past_backoff = match entry.last_attempt_at {
                    Some(last) => now - last >= self.failure_backoff,
                    None => true,
                };
                if past_backoff {
                    Disposition::Ready
                } else {
                    Disposition::Deferred
                }
            }
            None => Disposition::Settled,
        }
    }

    /// Atomically claim `(source_handle, source_event_id)` for delivery.
    pub async fn claim(
        &self,
        source_handle: &str,
        source_event_id: &str,
    ) -> Result<ClaimOutcome, AppError> {
        self.db
            .claim_delivery(
                source_handle,
                source_event_id,
                Utc::now(),
                self.pending_timeout,
                self.failure_backoff,
                self.max_attempts,
            )
            .await
    }

    /// Settle a claimed entry as sent.
    pub async fn record_sent(
        &self,
        source_handle: &str,
        source_event_id: &str,
    ) -> Result<bool, AppError> {
        self.db
            .record_delivery_sent(source_handle, source_event_id, Utc::now())
            .await
    }

    /// Settle a claimed entry as suppressed (claimed, then found the
    /// link disabled or revoked before dispatch).
    pub async fn record_suppressed(
        &self,
        source_handle: &str,
        source_event_id: &str,
        reason: &str,
    ) -> Result<bool, AppError> {
        self.db
            .record_delivery_suppressed(source_handle, source_event_id, reason, Utc::now())
            .await
    }

    /// Settle a claimed entry as failed.
    ///
    /// # Returns
    /// The attempt count after this failure, or `None` when the entry
    /// was not pending (another worker settled it first).
    pub async fn record_failure(
        &self,
        source_handle: &str,
        source_event_id: &str,
        reason: &str,
    ) -> Result<Option<i64>, AppError> {
        self.db
            .record_delivery_failure(source_handle, source_event_id, reason, Utc::now())
            .await
    }

    pub fn max_attempts(&self) -> i64 {
        self.max_attempts
    }

    /// Purge settled rows older than the retention window.
    ///
    /// Pending rows and failures that still have retries left are kept
    /// regardless of age.
    pub async fn purge_expired(&self) -> Result<u64, AppError> {
        let cutoff = Utc::now() - self.retention;
        let purged = self
            .db
            .purge_ledger_older_than(cutoff, self.max_attempts)
            .await?;

        LEDGER_ROWS_PURGED_TOTAL.inc_by(purged);
        if purged > 0 {
            tracing::info!(rows = purged, "Purged delivery ledger");
        }
        Ok(purged)
    }
}
