//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Linked accounts
// =============================================================================

/// A pairing between a source-platform identity and a sink device/token
///
/// At most one non-revoked row exists per `source_handle` (enforced by a
/// partial unique index). Unlinking soft-deletes by setting `revoked_at`,
/// so a `sink_id` may appear on multiple historical rows but only the
/// most recent one is active.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LinkedAccount {
    pub id: String,
    /// Identifier on the source platform (e.g., "alice")
    pub source_handle: String,
    /// Destination-platform device/app identifier
    pub sink_id: i64,
    /// Opaque credential required by the sink's push API
    pub delivery_token: String,
    /// Sink-specific URL notifications are POSTed to
    pub callback_endpoint: String,
    /// When false, the account is skipped by the scheduler but the
    /// link is retained
    pub notifications_enabled: bool,
    /// Set on unlink; active rows have NULL here
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Read cursors
// =============================================================================

/// Last acknowledged read position per source handle
///
/// Monotonically non-decreasing. Only bounds the unread window on the
/// first fetch for a handle; the delivery ledger is authoritative for
/// dedup.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReadCursor {
    pub source_handle: String,
    pub last_acknowledged_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Delivery ledger
// =============================================================================

/// Dedup/idempotency record for one `(source_handle, source_event_id)`
///
/// Created when a delivery is claimed. The composite primary key backs
/// the atomic insert-if-absent that prevents double-send.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub source_handle: String,
    /// Stable identifier derived from the source event
    pub source_event_id: String,
    /// Outcome: pending, sent, suppressed, failed_permanent
    pub outcome: String,
    /// Delivery attempts made so far
    pub attempts: i64,
    /// When the current claim was taken
    pub claimed_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// Delivery outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Claimed; dispatch in flight or abandoned
    Pending,
    /// Delivered to the sink; never retried
    Sent,
    /// Claimed but skipped (link revoked/disabled mid-cycle); never retried
    Suppressed,
    /// Sink rejected; retried on a decayed schedule until attempts run out
    FailedPermanent,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Suppressed => "suppressed",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "suppressed" => Some(Self::Suppressed),
            "failed_permanent" => Some(Self::FailedPermanent),
            _ => None,
        }
    }
}
