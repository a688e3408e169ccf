//! SQLite database operations
//!
//! All database access goes through this module.
//! The delivery ledger's claim protocol lives here: the composite
//! primary key on `(source_handle, source_event_id)` backs an atomic
//! insert-if-absent, which is the relay's only concurrency primitive.

use chrono::{DateTime, Utc};
use sqlx::{Pool, QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

/// Result of attempting to claim a `(source_handle, source_event_id)`
/// pair for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The claim is ours; the caller proceeds to dispatch.
    Claimed,
    /// A terminal outcome (sent or suppressed) is already recorded.
    AlreadyDelivered,
    /// Another cycle holds a fresh pending claim for this pair.
    Busy,
    /// A failed entry is still inside its backoff window or has
    /// exhausted its attempts.
    NotEligible,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!("Migration failed: {}", e);
            AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
        })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Linked accounts
    // =========================================================================

    /// Get the active (non-revoked) link for a source handle
    pub async fn get_active_link(
        &self,
        source_handle: &str,
    ) -> Result<Option<LinkedAccount>, AppError> {
        let link = sqlx::query_as::<_, LinkedAccount>(
            "SELECT * FROM linked_accounts WHERE source_handle = ? AND revoked_at IS NULL",
        )
        .bind(source_handle)
        .fetch_optional(&self.pool)
        .await?;

        Ok(link)
    }

    /// Insert a link only when no active link exists for its handle.
    ///
    /// Atomic at the SQL statement level: the partial unique index on
    /// active handles turns a concurrent duplicate into an ignored
    /// insert rather than a second active row.
    ///
    /// # Returns
    /// `true` if inserted, `false` if an active link already existed.
    pub async fn insert_link_if_absent(&self, link: &LinkedAccount) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO linked_accounts (
                id, source_handle, sink_id, delivery_token, callback_endpoint,
                notifications_enabled, revoked_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(&link.id)
        .bind(&link.source_handle)
        .bind(link.sink_id)
        .bind(&link.delivery_token)
        .bind(&link.callback_endpoint)
        .bind(link.notifications_enabled)
        .bind(link.created_at)
        .bind(link.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Refresh credential fields on the active link for a handle.
    ///
    /// # Returns
    /// `true` if updated, `false` if no active link exists.
    pub async fn refresh_link(
        &self,
        source_handle: &str,
        delivery_token: &str,
        callback_endpoint: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE linked_accounts
            SET delivery_token = ?, callback_endpoint = ?, updated_at = ?
            WHERE source_handle = ? AND revoked_at IS NULL
            "#,
        )
        .bind(delivery_token)
        .bind(callback_endpoint)
        .bind(updated_at)
        .bind(source_handle)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Revoke the current active link for a handle and insert a
    /// replacement in one transaction.
    pub async fn supersede_link(
        &self,
        link: &LinkedAccount,
        revoked_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<(), AppError> = async {
            sqlx::query(
                r#"
                UPDATE linked_accounts
                SET revoked_at = ?, updated_at = ?
                WHERE source_handle = ? AND revoked_at IS NULL
                "#,
            )
            .bind(revoked_at)
            .bind(revoked_at)
            .bind(&link.source_handle)
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO linked_accounts (
                    id, source_handle, sink_id, delivery_token, callback_endpoint,
                    notifications_enabled, revoked_at, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?)
                "#,
            )
            .bind(&link.id)
            .bind(&link.source_handle)
            .bind(link.sink_id)
            .bind(&link.delivery_token)
            .bind(&link.callback_endpoint)
            .bind(link.notifications_enabled)
            .bind(link.created_at)
            .bind(link.updated_at)
            .execute(&mut *conn)
            .await?;

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Soft-revoke the active link for a handle.
    ///
    /// # Returns
    /// `true` if a link was revoked, `false` if none was active.
    pub async fn revoke_link(
        &self,
        source_handle: &str,
        revoked_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE linked_accounts
            SET revoked_at = ?, updated_at = ?
            WHERE source_handle = ? AND revoked_at IS NULL
            "#,
        )
        .bind(revoked_at)
        .bind(revoked_at)
        .bind(source_handle)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Toggle notification delivery for the active link of a handle.
    ///
    /// # Returns
    /// `true` if updated, `false` if no active link exists.
    pub async fn set_notifications_enabled(
        &self,
        source_handle: &str,
        enabled: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE linked_accounts
            SET notifications_enabled = ?, updated_at = ?
            WHERE source_handle = ? AND revoked_at IS NULL
            "#,
        )
        .bind(enabled)
        .bind(updated_at)
        .bind(source_handle)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// List active links with notifications enabled, ordered by handle.
    ///
    /// Read-only; safe to call every cycle.
    pub async fn list_eligible_links(&self) -> Result<Vec<LinkedAccount>, AppError> {
        let links = sqlx::query_as::<_, LinkedAccount>(
            r#"
            SELECT * FROM linked_accounts
            WHERE revoked_at IS NULL AND notifications_enabled = 1
            ORDER BY source_handle
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(links)
    }

    /// Resolve active links by sink identifier.
    ///
    /// Used when the sink's webhook announces a change and the relay
    /// must map it back to source handles.
    pub async fn get_links_by_sink_id(&self, sink_id: i64) -> Result<Vec<LinkedAccount>, AppError> {
        let links = sqlx::query_as::<_, LinkedAccount>(
            "SELECT * FROM linked_accounts WHERE sink_id = ? AND revoked_at IS NULL",
        )
        .bind(sink_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(links)
    }

    /// Revoke all active links for a sink identifier.
    ///
    /// # Returns
    /// Number of links revoked.
    pub async fn revoke_links_by_sink_id(
        &self,
        sink_id: i64,
        revoked_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE linked_accounts
            SET revoked_at = ?, updated_at = ?
            WHERE sink_id = ? AND revoked_at IS NULL
            "#,
        )
        .bind(revoked_at)
        .bind(revoked_at)
        .bind(sink_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Toggle notification delivery for all active links of a sink id.
    ///
    /// # Returns
    /// Number of links updated.
    pub async fn set_notifications_enabled_by_sink_id(
        &self,
        sink_id: i64,
        enabled: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE linked_accounts
            SET notifications_enabled = ?, updated_at = ?
            WHERE sink_id = ? AND revoked_at IS NULL
            "#,
        )
        .bind(enabled)
        .bind(updated_at)
        .bind(sink_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Replace delivery credentials for all active links of a sink id.
    ///
    /// # Returns
    /// Number of links updated.
    pub async fn rotate_delivery_token_by_sink_id(
        &self,
        sink_id: i64,
        delivery_token: &str,
        callback_endpoint: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE linked_accounts
            SET delivery_token = ?, callback_endpoint = ?, updated_at = ?
            WHERE sink_id = ? AND revoked_at IS NULL
            "#,
        )
        .bind(delivery_token)
        .bind(callback_endpoint)
        .bind(updated_at)
        .bind(sink_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Count active links (for the registry gauge).
    pub async fn count_active_links(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM linked_accounts WHERE revoked_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    // =========================================================================
    // Read cursors
    // =========================================================================

    /// Get the read cursor for a handle
    pub async fn get_read_cursor(
        &self,
        source_handle: &str,
    ) -> Result<Option<ReadCursor>, AppError> {
        let cursor = sqlx::query_as::<_, ReadCursor>(
            "SELECT * FROM read_cursors WHERE source_handle = ?",
        )
        .bind(source_handle)
        .fetch_optional(&self.pool)
        .await?;

        Ok(cursor)
    }

    /// Advance the read cursor for a handle.
    ///
    /// Monotonic: an upsert that would move the cursor backwards is a
    /// no-op, so overlapping cycles cannot regress it.
    pub async fn advance_read_cursor(
        &self,
        source_handle: &str,
        last_acknowledged_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO read_cursors (source_handle, last_acknowledged_at, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(source_handle) DO UPDATE SET
                last_acknowledged_at = excluded.last_acknowledged_at,
                updated_at = excluded.updated_at
            WHERE excluded.last_acknowledged_at > read_cursors.last_acknowledged_at
            "#,
        )
        .bind(source_handle)
        .bind(last_acknowledged_at)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Delivery ledger
    // =========================================================================

    /// Get one ledger entry
    pub async fn get_ledger_entry(
        &self,
        source_handle: &str,
        source_event_id: &str,
    ) -> Result<Option<LedgerEntry>, AppError> {
        let entry = sqlx::query_as::<_, LedgerEntry>(
            "SELECT * FROM delivery_ledger WHERE source_handle = ? AND source_event_id = ?",
        )
        .bind(source_handle)
        .bind(source_event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Get the ledger entries for a set of event ids under one handle.
    pub async fn get_ledger_entries(
        &self,
        source_handle: &str,
        source_event_ids: &[String],
    ) -> Result<Vec<LedgerEntry>, AppError> {
        if source_event_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT * FROM delivery_ledger WHERE source_handle = ",
        );
        builder.push_bind(source_handle);
        builder.push(" AND source_event_id IN (");
        let mut separated = builder.separated(", ");
        for event_id in source_event_ids {
            separated.push_bind(event_id);
        }
        builder.push(")");

        let entries = builder
            .build_query_as::<LedgerEntry>()
            .fetch_all(&self.pool)
            .await?;

        Ok(entries)
    }

    /// Atomically claim a `(source_handle, source_event_id)` pair.
    ///
    /// A fresh pair is claimed by an ignored-on-conflict insert. An
    /// existing pair is reclaimed by a guarded update when its pending
    /// claim is older than `pending_timeout` (stuck), or when it failed,
    /// its backoff has elapsed and it still has attempts left. Exactly
    /// one of two racing callers can win either path.
    pub async fn claim_delivery(
        &self,
        source_handle: &str,
        source_event_id: &str,
        now: DateTime<Utc>,
        pending_timeout: chrono::Duration,
        failure_backoff: chrono::Duration,
        max_attempts: i64,
    ) -> Result<ClaimOutcome, AppError> {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO delivery_ledger (
                source_handle, source_event_id, outcome, attempts, claimed_at
            ) VALUES (?, ?, 'pending', 0, ?)
            "#,
        )
        .bind(source_handle)
        .bind(source_event_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        let stale_before = now - pending_timeout;
        let retry_before = now - failure_backoff;
        let reclaimed = sqlx::query(
            r#"
            UPDATE delivery_ledger
            SET outcome = 'pending', claimed_at = ?, failure_reason = NULL
            WHERE source_handle = ? AND source_event_id = ?
              AND (
                  (outcome = 'pending' AND claimed_at < ?)
                  OR (
                      outcome = 'failed_permanent'
                      AND attempts < ?
                      AND COALESCE(last_attempt_at, claimed_at) < ?
                  )
              )
            "#,
        )
        .bind(now)
        .bind(source_handle)
        .bind(source_event_id)
        .bind(stale_before)
        .bind(max_attempts)
        .bind(retry_before)
        .execute(&self.pool)
        .await?;

        if reclaimed.rows_affected() == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        let entry = self.get_ledger_entry(source_handle, source_event_id).await?;
        match entry.as_ref().map(|e| e.outcome.as_str()) {
            Some("pending") => Ok(ClaimOutcome::Busy),
            Some("failed_permanent") => Ok(ClaimOutcome::NotEligible),
            Some(_) => Ok(ClaimOutcome::AlreadyDelivered),
            // Purged between statements; the next cycle reconsiders it.
            None => Ok(ClaimOutcome::Busy),
        }
    }

    /// Mark a claimed delivery as sent.
    ///
    /// Guarded on `outcome = 'pending'`: a claim that was reclaimed by
    /// another cycle in the meantime is not overwritten.
    ///
    /// # Returns
    /// `true` if the claim was ours and is now `sent`.
    pub async fn record_delivery_sent(
        &self,
        source_handle: &str,
        source_event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_ledger
            SET outcome = 'sent', attempts = attempts + 1,
                last_attempt_at = ?, delivered_at = ?, failure_reason = NULL
            WHERE source_handle = ? AND source_event_id = ? AND outcome = 'pending'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(source_handle)
        .bind(source_event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark a claimed delivery as suppressed (claimed, then skipped
    /// because the link was revoked or disabled mid-cycle). Terminal;
    /// does not count as an attempt.
    pub async fn record_delivery_suppressed(
        &self,
        source_handle: &str,
        source_event_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_ledger
            SET outcome = 'suppressed', last_attempt_at = ?, failure_reason = ?
            WHERE source_handle = ? AND source_event_id = ? AND outcome = 'pending'
            "#,
        )
        .bind(now)
        .bind(reason)
        .bind(source_handle)
        .bind(source_event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark a claimed delivery as failed and bump its attempt count.
    ///
    /// # Returns
    /// The new attempt count, or `None` if the claim was not ours.
    pub async fn record_delivery_failure(
        &self,
        source_handle: &str,
        source_event_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_ledger
            SET outcome = 'failed_permanent', attempts = attempts + 1,
                last_attempt_at = ?, failure_reason = ?
            WHERE source_handle = ? AND source_event_id = ? AND outcome = 'pending'
            "#,
        )
        .bind(now)
        .bind(reason)
        .bind(source_handle)
        .bind(source_event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let attempts = sqlx::query_scalar::<_, i64>(
            "SELECT attempts FROM delivery_ledger WHERE source_handle = ? AND source_event_id = ?",
        )
        .bind(source_handle)
        .bind(source_event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(attempts))
    }

    /// Purge terminal ledger rows older than the cutoff.
    ///
    /// Pending rows are never purged regardless of age (a stuck pending
    /// is reclaimed through `claim_delivery` instead). Failed rows are
    /// only purged once their attempts are exhausted.
    ///
    /// # Returns
    /// Number of rows removed.
    pub async fn purge_ledger_older_than(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: i64,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM delivery_ledger
            WHERE outcome != 'pending'
              AND COALESCE(delivered_at, last_attempt_at, claimed_at) < ?
              AND (outcome != 'failed_permanent' OR attempts >= ?)
            "#,
        )
        .bind(cutoff)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
