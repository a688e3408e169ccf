//! Delivery scheduler
//!
//! Orchestrates one relay cycle: for every eligible account, fetch
//! unread activity, filter it through the ledger, claim what survives,
//! shape notifications, dispatch them in batches, and record outcomes.
//! Accounts are processed concurrently under a bounded worker pool;
//! within one account the pipeline is strictly sequential.
//!
//! The read cursor only advances after a cycle that settled everything
//! it fetched. Any event left pending, deferred, or retryable keeps
//! the cursor in place so the event's content can be fetched again for
//! the retry.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};

use crate::config::RelayConfig;
use crate::data::{ClaimOutcome, LinkedAccount};
use crate::error::AppError;
use crate::metrics::{
    ACCOUNTS_PROCESSED_TOTAL, CLAIM_RACES_LOST_TOTAL, DELIVERY_FAILURES_TOTAL,
    NOTIFICATIONS_SENT_TOTAL, NOTIFICATIONS_SUPPRESSED_TOTAL, RELAY_CYCLES_TOTAL,
    RELAY_CYCLE_DURATION_SECONDS,
};
use crate::push::{Notification, PushGateway};
use crate::service::{FetcherService, LedgerService, RegistryService};

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTrigger {
    Timer,
    OnDemand,
}

impl CycleTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::OnDemand => "on_demand",
        }
    }
}

/// Summary of one relay cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub accounts_processed: usize,
    pub accounts_skipped: usize,
    pub accounts_failed: usize,
    pub notifications_sent: usize,
}

/// One claimed event, shaped and ready for dispatch.
struct PreparedDelivery {
    source_handle: String,
    delivery_token: String,
    callback_endpoint: String,
    source_event_id: String,
    notification: Notification,
}

/// Everything the prepare phase produced for one account.
struct PreparedAccount {
    account: LinkedAccount,
    deliveries: Vec<PreparedDelivery>,
    /// Newest fetched event timestamp, cursor candidate
    fetched_through: Option<DateTime<Utc>>,
    /// True when any event was deferred or lost to a claim race;
    /// blocks cursor advancement for this cycle
    unsettled: bool,
}

enum PrepareResult {
    Prepared(PreparedAccount),
    Skipped(String),
    Failed(String),
}

/// Per-account tally accumulated during dispatch.
#[derive(Debug, Default, Clone, Copy)]
struct AccountProgress {
    sent: usize,
    unresolved: bool,
}

/// Delivery scheduler
///
/// Cheap to clone; every field is shared or copyable, which lets each
/// spawned account task carry its own handle.
#[derive(Clone)]
pub struct RelayScheduler {
    registry: Arc<RegistryService>,
    fetcher: Arc<FetcherService>,
    ledger: Arc<LedgerService>,
    gateway: Arc<dyn PushGateway>,
    max_concurrent_accounts: usize,
    lease_duration: Duration,
    leases: Arc<Mutex<HashMap<String, Instant>>>,
}

impl RelayScheduler {
    pub fn new(
        registry: Arc<RegistryService>,
        fetcher: Arc<FetcherService>,
        ledger: Arc<LedgerService>,
        gateway: Arc<dyn PushGateway>,
        relay: &RelayConfig,
    ) -> Self {
        Self {
            registry,
            fetcher,
            ledger,
            gateway,
            max_concurrent_accounts: relay.max_concurrent_accounts,
            lease_duration: relay.lease(),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one full cycle over all eligible accounts.
    ///
    /// Per-account failures are contained: a fetch error fails that
    /// account only. Only a store failure while listing accounts aborts
    /// the cycle itself.
    pub async fn run_cycle(&self, trigger: CycleTrigger) -> Result<CycleReport, AppError> {
        let timer = RELAY_CYCLE_DURATION_SECONDS.start_timer();
        RELAY_CYCLES_TOTAL
            .with_label_values(&[trigger.as_str()])
            .inc();

        let accounts = self.registry.list_eligible_accounts().await?;
        tracing::debug!(
            accounts = accounts.len(),
            trigger = trigger.as_str(),
            "Starting relay cycle"
        );

        // Prepare phase: fetch, filter, and claim per account, in
        // parallel with a concurrency limit.
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_accounts));
        let mut tasks = Vec::new();
        for account in accounts {
            let semaphore = semaphore.clone();
            let scheduler = self.clone();
            let task = tokio::spawn(async move {
                let _permit = semaphore.acquire().await.unwrap();
                scheduler.prepare_account(account).await
            });
            tasks.push(task);
        }

        let mut report = CycleReport::default();
        let mut prepared = Vec::new();
        for task in tasks {
            if let Ok(result) = task.await {
                match result {
                    PrepareResult::Prepared(account) => prepared.push(account),
                    PrepareResult::Skipped(handle) => {
                        ACCOUNTS_PROCESSED_TOTAL
                            .with_label_values(&["skipped"])
                            .inc();
                        tracing::debug!(source_handle = %handle, "Account leased elsewhere; skipped");
                        report.accounts_skipped += 1;
                    }
                    PrepareResult::Failed(handle) => {
                        ACCOUNTS_PROCESSED_TOTAL
                            .with_label_values(&["failed"])
                            .inc();
                        tracing::debug!(source_handle = %handle, "Account failed this cycle");
                        report.accounts_failed += 1;
                    }
                }
            }
        }

        // Dispatch phase: same-shaped notifications to the same
        // endpoint go out as one batch.
        let mut progress = self.dispatch_prepared(&prepared).await;

        for account in &prepared {
            let handle = &account.account.source_handle;
            let account_progress = progress.remove(handle.as_str()).unwrap_or_default();

            ACCOUNTS_PROCESSED_TOTAL.with_label_values(&["ok"]).inc();
            report.accounts_processed += 1;
            report.notifications_sent += account_progress.sent;

            self.finalize_account(account, &account_progress).await;
        }

        timer.observe_duration();
        tracing::info!(
            processed = report.accounts_processed,
            skipped = report.accounts_skipped,
            failed = report.accounts_failed,
            sent = report.notifications_sent,
            trigger = trigger.as_str(),
            "Relay cycle complete"
        );
        Ok(report)
    }

    /// Run one synchronous cycle for a single handle.
    ///
    /// Returns the number of notifications sent. Fetch and store errors
    /// surface to the caller; per-event delivery failures do not (the
    /// count simply excludes them).
    ///
    /// # Errors
    /// `NotFound` when the handle has no active link.
    pub async fn run_for_handle(&self, source_handle: &str) -> Result<usize, AppError> {
        RELAY_CYCLES_TOTAL
            .with_label_values(&[CycleTrigger::OnDemand.as_str()])
            .inc();

        let link = self.registry.get_link(source_handle).await?;
        if !link.notifications_enabled {
            tracing::debug!(source_handle = %source_handle, "Notifications disabled; nothing to deliver");
            return Ok(0);
        }

        let handle = link.source_handle.clone();
        if !self.try_acquire_lease(&handle).await {
            tracing::debug!(source_handle = %handle, "Account leased by another cycle; skipping on-demand run");
            return Ok(0);
        }

        let prepared = match self.prepare_deliveries(link).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.release_lease(&handle).await;
                return Err(e);
            }
        };

        let prepared = [prepared];
        let mut progress = self.dispatch_prepared(&prepared).await;
        let account_progress = progress.remove(handle.as_str()).unwrap_or_default();

        self.finalize_account(&prepared[0], &account_progress).await;

        Ok(account_progress.sent)
    }

    /// Lease, then fetch/filter/claim. Owns lease release on failure;
    /// successful prepares keep the lease until finalization.
    async fn prepare_account(&self, account: LinkedAccount) -> PrepareResult {
        let handle = account.source_handle.clone();

        if !self.try_acquire_lease(&handle).await {
            return PrepareResult::Skipped(handle);
        }

        match self.prepare_deliveries(account).await {
            Ok(prepared) => PrepareResult::Prepared(prepared),
            Err(e) => {
                tracing::warn!(
                    source_handle = %handle,
                    error = %e,
                    "Account preparation failed; will retry next cycle"
                );
                self.release_lease(&handle).await;
                PrepareResult::Failed(handle)
            }
        }
    }

    async fn prepare_deliveries(
        &self,
        account: LinkedAccount,
    ) -> Result<PreparedAccount, AppError> {
        let events = self.fetcher.unread_events(&account.source_handle).await?;
        let fetched_through = events.iter().map(|event| event.occurred_at).max();

        let filtered = self
            .ledger
            .filter_undelivered(&account.source_handle, events)
            .await?;
        let mut unsettled = filtered.deferred > 0;

        let mut deliveries = Vec::new();
        for event in filtered.ready {
            match self
                .ledger
                .claim(&account.source_handle, &event.source_event_id)
                .await?
            {
                ClaimOutcome::Claimed => {
                    deliveries.push(PreparedDelivery {
                        source_handle: account.source_handle.clone(),
                        delivery_token: account.delivery_token.clone(),
                        callback_endpoint: account.callback_endpoint.clone(),
                        source_event_id: event.source_event_id.clone(),
                        notification: Notification::new(
                            &event.source_event_id,
                            &event.title,
                            &event.body,
                            &event.target_url,
                        ),
                    });
                }
                ClaimOutcome::Busy => {
                    // Expected under concurrency: another worker owns
                    // this event right now.
                    CLAIM_RACES_LOST_TOTAL.inc();
                    tracing::debug!(
                        source_handle = %account.source_handle,
                        source_event_id = %event.source_event_id,
                        "Lost claim race"
                    );
                    unsettled = true;
                }
                ClaimOutcome::AlreadyDelivered | ClaimOutcome::NotEligible => {}
            }
        }

        Ok(PreparedAccount {
            account,
            deliveries,
            fetched_through,
            unsettled,
        })
    }

    /// Group claimed deliveries by (endpoint, message shape) and send
    /// each group as one batch, recording per-token outcomes.
    async fn dispatch_prepared(
        &self,
        prepared: &[PreparedAccount],
    ) -> HashMap<String, AccountProgress> {
        let mut progress: HashMap<String, AccountProgress> = HashMap::new();

        // Re-check eligibility: a link can be revoked or muted between
        // claim and dispatch (webhooks run concurrently with cycles).
        let mut live: Vec<&PreparedDelivery> = Vec::new();
        for account in prepared {
            if account.deliveries.is_empty() {
                continue;
            }
            let handle = &account.account.source_handle;
            match self.registry.get_link(handle).await {
                Ok(link) if link.notifications_enabled => {
                    live.extend(account.deliveries.iter());
                }
                Ok(_) => {
                    self.suppress_all(account, "notifications_disabled", &mut progress)
                        .await;
                }
                Err(AppError::NotFound) => {
                    self.suppress_all(account, "link_revoked", &mut progress)
                        .await;
                }
                Err(e) => {
                    tracing::error!(
                        source_handle = %handle,
                        error = %e,
                        "Eligibility recheck failed; claims stay pending"
                    );
                    progress.entry(handle.clone()).or_default().unresolved = true;
                }
            }
        }

        let mut groups: HashMap<(String, Notification), Vec<&PreparedDelivery>> = HashMap::new();
        for delivery in live {
            groups
                .entry((
                    delivery.callback_endpoint.clone(),
                    delivery.notification.clone(),
                ))
                .or_default()
                .push(delivery);
        }

        for ((endpoint, notification), members) in groups {
            self.dispatch_group(&endpoint, &notification, &members, &mut progress)
                .await;
        }

        progress
    }

    async fn dispatch_group(
        &self,
        endpoint: &str,
        notification: &Notification,
        members: &[&PreparedDelivery],
        progress: &mut HashMap<String, AccountProgress>,
    ) {
        let mut tokens = Vec::new();
        let mut seen = HashSet::new();
        for member in members {
            if seen.insert(member.delivery_token.as_str()) {
                tokens.push(member.delivery_token.clone());
            }
        }

        match self.gateway.send_batch(endpoint, &tokens, notification).await {
            Ok(receipt) => {
                let invalid: HashSet<&str> =
                    receipt.invalid_tokens.iter().map(String::as_str).collect();
                let rate_limited: HashSet<&str> = receipt
                    .rate_limited_tokens
                    .iter()
                    .map(String::as_str)
                    .collect();

                for member in members {
                    let (sent, unresolved) = self
                        .settle_member(member, &invalid, &rate_limited)
                        .await;
                    let entry = progress.entry(member.source_handle.clone()).or_default();
                    entry.sent += sent;
                    entry.unresolved |= unresolved;
                }
            }
            Err(e) => {
                // Batch-level failure: no token outcome is known, so
                // every claim stays pending for a later reclaim.
                DELIVERY_FAILURES_TOTAL
                    .with_label_values(&["sink_unreachable"])
                    .inc();
                tracing::warn!(
                    endpoint = %endpoint,
                    tokens = tokens.len(),
                    error = %e,
                    "Batch dispatch failed; claims stay pending"
                );
                for member in members {
                    progress
                        .entry(member.source_handle.clone())
                        .or_default()
                        .unresolved = true;
                }
            }
        }
    }

    /// Settle one group member against the batch receipt.
    ///
    /// # Returns
    /// `(sent, unresolved)` for the member's account tally.
    async fn settle_member(
        &self,
        member: &PreparedDelivery,
        invalid: &HashSet<&str>,
        rate_limited: &HashSet<&str>,
    ) -> (usize, bool) {
        let token = member.delivery_token.as_str();

        if invalid.contains(token) {
            DELIVERY_FAILURES_TOTAL
                .with_label_values(&["invalid_token"])
                .inc();
            match self
                .ledger
                .record_failure(&member.source_handle, &member.source_event_id, "invalid_token")
                .await
            {
                Ok(Some(attempts)) if attempts >= self.ledger.max_attempts() => {
                    // The sink has said this token is gone for good.
                    if let Err(e) = self
                        .registry
                        .disable_notifications(&member.source_handle)
                        .await
                    {
                        tracing::error!(
                            source_handle = %member.source_handle,
                            error = %e,
                            "Failed to disable notifications for exhausted token"
                        );
                    }
                    (0, false)
                }
                Ok(Some(_)) => (0, true),
                Ok(None) => {
                    tracing::warn!(
                        source_handle = %member.source_handle,
                        source_event_id = %member.source_event_id,
                        "Claim was settled elsewhere before failure could be recorded"
                    );
                    (0, false)
                }
                Err(e) => {
                    tracing::error!(
                        source_handle = %member.source_handle,
                        error = %e,
                        "Failed to record delivery failure"
                    );
                    (0, true)
                }
            }
        } else if rate_limited.contains(token) {
            // No attempt is charged; the pending claim is reclaimed
            // after the stuck-pending timeout.
            DELIVERY_FAILURES_TOTAL
                .with_label_values(&["rate_limited"])
                .inc();
            tracing::debug!(
                source_handle = %member.source_handle,
                source_event_id = %member.source_event_id,
                "Token rate limited; claim stays pending"
            );
            (0, true)
        } else {
            match self
                .ledger
                .record_sent(&member.source_handle, &member.source_event_id)
                .await
            {
                Ok(true) => {
                    NOTIFICATIONS_SENT_TOTAL.inc();
                    (1, false)
                }
                Ok(false) => {
                    tracing::warn!(
                        source_handle = %member.source_handle,
                        source_event_id = %member.source_event_id,
                        "Claim was settled elsewhere before send could be recorded"
                    );
                    (0, false)
                }
                Err(e) => {
                    tracing::error!(
                        source_handle = %member.source_handle,
                        error = %e,
                        "Failed to record sent delivery"
                    );
                    (0, true)
                }
            }
        }
    }

    async fn suppress_all(
        &self,
        account: &PreparedAccount,
        reason: &str,
        progress: &mut HashMap<String, AccountProgress>,
    ) {
        let handle = &account.account.source_handle;
        for delivery in &account.deliveries {
            match self
                .ledger
                .record_suppressed(handle, &delivery.source_event_id, reason)
                .await
            {
                Ok(true) => {
                    NOTIFICATIONS_SUPPRESSED_TOTAL
                        .with_label_values(&[reason])
                        .inc();
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        source_handle = %handle,
                        error = %e,
                        "Failed to record suppression"
                    );
                    progress.entry(handle.clone()).or_default().unresolved = true;
                }
            }
        }
        tracing::info!(
            source_handle = %handle,
            suppressed = account.deliveries.len(),
            reason = reason,
            "Suppressed claimed events for inactive link"
        );
    }

    /// Advance the cursor when everything fetched this cycle settled,
    /// then release the account lease.
    async fn finalize_account(&self, account: &PreparedAccount, progress: &AccountProgress) {
        let handle = &account.account.source_handle;

        if !account.unsettled && !progress.unresolved {
            if let Some(through) = account.fetched_through {
                if let Err(e) = self.fetcher.acknowledge_through(handle, through).await {
                    tracing::warn!(
                        source_handle = %handle,
                        error = %e,
                        "Failed to advance read cursor"
                    );
                }
            }
        }

        self.release_lease(handle).await;
    }

    async fn try_acquire_lease(&self, source_handle: &str) -> bool {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        leases.retain(|_, taken| now.duration_since(*taken) < self.lease_duration);

        match leases.entry(source_handle.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    async fn release_lease(&self, source_handle: &str) {
        self.leases.lock().await.remove(source_handle);
    }
}
