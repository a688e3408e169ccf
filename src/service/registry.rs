//! Identity link registry service
//!
//! Owns the pairing between source-platform handles and sink-platform
//! device tokens, including the lifecycle the sink drives back at us
//! through webhooks (unlink, token rotation, preference toggles).

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;

use crate::data::{Database, EntityId, LinkedAccount};
use crate::error::AppError;
use crate::metrics::LINKED_ACCOUNTS_ACTIVE;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Validate a callback endpoint before storing it.
///
/// Rejects non-HTTP(S) URLs and, unless private endpoints are allowed,
/// obvious local/private hosts. The relay POSTs to this URL on every
/// delivery, so a hostile value here would turn it into an SSRF proxy.
fn validate_callback_endpoint(endpoint: &str, allow_private: bool) -> Result<(), AppError> {
    let parsed = url::Url::parse(endpoint)
        .map_err(|e| AppError::Validation(format!("Invalid callback endpoint: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported callback endpoint scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in callback endpoint".to_string()))?;

    if !allow_private && is_disallowed_host(host) {
        return Err(AppError::Validation(
            "Callback endpoint must not point at a local or private host".to_string(),
        ));
    }

    Ok(())
}

/// Identity link registry service
pub struct RegistryService {
    db: Arc<Database>,
    allow_private_endpoints: bool,
}

impl RegistryService {
    /// Create new registry service
    pub fn new(db: Arc<Database>, allow_private_endpoints: bool) -> Self {
        Self {
            db,
            allow_private_endpoints,
        }
    }

    /// Link a source handle to a sink device/token pair.
    ///
    /// Re-linking the same `(source_handle, sink_id)` pair refreshes the
    /// stored credentials and is always allowed. Linking a handle that is
    /// already active on a *different* sink id fails with a conflict
    /// unless `supersede` is set, in which case the old link is revoked
    /// and replaced in one transaction.
    ///
    /// # Errors
    /// - `Validation` for empty handles/tokens or a bad callback endpoint
    /// - `Conflict` when an active link for another sink id exists and
    ///   `supersede` is false
    pub async fn link_account(
        &self,
        source_handle: &str,
        sink_id: i64,
        delivery_token: &str,
        callback_endpoint: &str,
        supersede: bool,
    ) -> Result<LinkedAccount, AppError> {
        let source_handle = source_handle.trim();
        if source_handle.is_empty() {
            return Err(AppError::Validation(
                "source_handle cannot be empty".to_string(),
            ));
        }
        if sink_id <= 0 {
            return Err(AppError::Validation(
                "sink_id must be a positive integer".to_string(),
            ));
        }
        if delivery_token.trim().is_empty() {
            return Err(AppError::Validation(
                "delivery_token cannot be empty".to_string(),
            ));
        }
        validate_callback_endpoint(callback_endpoint, self.allow_private_endpoints)?;

        if let Some(existing) = self.db.get_active_link(source_handle).await? {
            if existing.sink_id == sink_id {
                // Same pairing, treat as a credential refresh. The user's
                // enabled/disabled preference is left alone.
                self.db
                    .refresh_link(source_handle, delivery_token, callback_endpoint, Utc::now())
                    .await?;
                return self
                    .db
                    .get_active_link(source_handle)
                    .await?
                    .ok_or(AppError::NotFound);
            }

            if !supersede {
                return Err(AppError::Conflict(format!(
                    "{} is already linked to sink id {}",
                    source_handle, existing.sink_id
                )));
            }

            let replacement = new_link(source_handle, sink_id, delivery_token, callback_endpoint);
            self.db.supersede_link(&replacement, Utc::now()).await?;
            tracing::info!(
                source_handle = %source_handle,
                old_sink_id = existing.sink_id,
                new_sink_id = sink_id,
                "Superseded account link"
            );
            self.refresh_active_gauge().await;
            return Ok(replacement);
        }

        let link = new_link(source_handle, sink_id, delivery_token, callback_endpoint);
        let inserted = self.db.insert_link_if_absent(&link).await?;
        if !inserted {
            // Lost a race with a concurrent link request for the same handle.
            return Err(AppError::Conflict(format!(
                "{} was linked concurrently",
                source_handle
            )));
        }

        tracing::info!(
            source_handle = %source_handle,
            sink_id = sink_id,
            "Linked account"
        );
        self.refresh_active_gauge().await;
        Ok(link)
    }

    /// Unlink a source handle.
    ///
    /// Idempotent: succeeds even when no active link exists. The sink's
    /// own registry is not called here; the sink announces its side of
    /// an unlink through the webhook instead.
    pub async fn unlink_account(&self, source_handle: &str) -> Result<(), AppError> {
        let revoked = self.db.revoke_link(source_handle.trim(), Utc::now()).await?;
        if revoked {
            tracing::info!(source_handle = %source_handle, "Unlinked account");
            self.refresh_active_gauge().await;
        }
        Ok(())
    }

    /// Update delivery preferences for an active link.
    ///
    /// # Errors
    /// Returns `NotFound` if the handle has no active link.
    pub async fn update_preferences(
        &self,
        source_handle: &str,
        notifications_enabled: bool,
    ) -> Result<LinkedAccount, AppError> {
        let source_handle = source_handle.trim();
        let updated = self
            .db
            .set_notifications_enabled(source_handle, notifications_enabled, Utc::now())
            .await?;
        if !updated {
            return Err(AppError::NotFound);
        }

        self.db
            .get_active_link(source_handle)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Get the active link for a handle.
    pub async fn get_link(&self, source_handle: &str) -> Result<LinkedAccount, AppError> {
        self.db
            .get_active_link(source_handle.trim())
            .await?
            .ok_or(AppError::NotFound)
    }

    /// List active links with notifications enabled.
    ///
    /// Read-only; the scheduler re-requests this every cycle.
    pub async fn list_eligible_accounts(&self) -> Result<Vec<LinkedAccount>, AppError> {
        self.db.list_eligible_links().await
    }

    /// Resolve a sink id back to its active links.
    pub async fn get_by_sink_id(&self, sink_id: i64) -> Result<Vec<LinkedAccount>, AppError> {
        self.db.get_links_by_sink_id(sink_id).await
    }

    /// Revoke every active link for a sink id (webhook `link.removed`).
    ///
    /// # Returns
    /// Number of links revoked.
    pub async fn remove_sink_links(&self, sink_id: i64) -> Result<u64, AppError> {
        let revoked = self.db.revoke_links_by_sink_id(sink_id, Utc::now()).await?;
        if revoked > 0 {
            tracing::info!(sink_id = sink_id, revoked = revoked, "Revoked sink links");
            self.refresh_active_gauge().await;
        }
        Ok(revoked)
    }

    /// Toggle notifications for every active link of a sink id
    /// (webhook `notifications.enabled` / `notifications.disabled`).
    pub async fn set_sink_notifications(
        &self,
        sink_id: i64,
        enabled: bool,
    ) -> Result<u64, AppError> {
        self.db
            .set_notifications_enabled_by_sink_id(sink_id, enabled, Utc::now())
            .await
    }

    /// Replace delivery credentials for every active link of a sink id
    /// (webhook `token.rotated`).
    pub async fn rotate_sink_token(
        &self,
        sink_id: i64,
        delivery_token: &str,
        callback_endpoint: &str,
    ) -> Result<u64, AppError> {
        if delivery_token.trim().is_empty() {
            return Err(AppError::Validation(
                "delivery_token cannot be empty".to_string(),
            ));
        }
        validate_callback_endpoint(callback_endpoint, self.allow_private_endpoints)?;

        self.db
            .rotate_delivery_token_by_sink_id(sink_id, delivery_token, callback_endpoint, Utc::now())
            .await
    }

    /// Disable notifications for a handle after its token was reported
    /// permanently invalid by the sink.
    pub async fn disable_notifications(&self, source_handle: &str) -> Result<bool, AppError> {
        let disabled = self
            .db
            .set_notifications_enabled(source_handle, false, Utc::now())
            .await?;
        if disabled {
            tracing::warn!(
                source_handle = %source_handle,
                "Disabled notifications after permanent token failure"
            );
        }
        Ok(disabled)
    }

    async fn refresh_active_gauge(&self) {
        if let Ok(count) = self.db.count_active_links().await {
            LINKED_ACCOUNTS_ACTIVE.set(count);
        }
    }
}

fn new_link(
    source_handle: &str,
    sink_id: i64,
    delivery_token: &str,
    callback_endpoint: &str,
) -> LinkedAccount {
    let now = Utc::now();
    LinkedAccount {
        id: EntityId::new().0,
        source_handle: source_handle.to_string(),
        sink_id,
        delivery_token: delivery_token.to_string(),
        callback_endpoint: callback_endpoint.to_string(),
        notifications_enabled: true,
        revoked_at: None,
        created_at: now,
        updated_at: now,
    }
}
