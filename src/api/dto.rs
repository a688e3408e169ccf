//! API request and response DTOs
//!
//! Every response carries a `success` flag so callers can branch without
//! inspecting HTTP status codes. Error bodies use the same shape with
//! `success: false` and a `message` (see [`crate::error::AppError`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::LinkedAccount;
use crate::service::CycleReport;

/// POST /api/v1/links request
#[derive(Debug, Deserialize)]
pub struct LinkAccountRequest {
    pub source_handle: String,
    pub sink_id: i64,
    pub delivery_token: String,
    pub callback_endpoint: String,
    /// Replace an existing link on a different sink account instead of
    /// rejecting with a conflict.
    #[serde(default)]
    pub supersede: bool,
}

/// PATCH /api/v1/links/:source_handle/preferences request
#[derive(Debug, Deserialize)]
pub struct UpdatePreferencesRequest {
    pub notifications_enabled: bool,
}

/// POST /api/v1/relay/trigger request
#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub source_handle: String,
}

/// Linked account as exposed over the API
///
/// The delivery token is a credential and is never echoed back.
#[derive(Debug, Clone, Serialize)]
pub struct LinkView {
    pub source_handle: String,
    pub sink_id: i64,
    pub callback_endpoint: String,
    pub notifications_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<LinkedAccount> for LinkView {
    fn from(link: LinkedAccount) -> Self {
        Self {
            source_handle: link.source_handle,
            sink_id: link.sink_id,
            callback_endpoint: link.callback_endpoint,
            notifications_enabled: link.notifications_enabled,
            created_at: link.created_at,
            updated_at: link.updated_at,
        }
    }
}

/// Single-link response envelope
#[derive(Debug, Serialize)]
pub struct LinkResponse {
    pub success: bool,
    pub link: LinkView,
}

impl LinkResponse {
    pub fn new(link: LinkedAccount) -> Self {
        Self {
            success: true,
            link: link.into(),
        }
    }
}

/// Acknowledgement for operations with no entity to return
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// POST /api/v1/relay/trigger response
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub notifications_sent: usize,
}

/// POST /api/v1/relay/run response
#[derive(Debug, Serialize)]
pub struct CycleResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: CycleReport,
}

/// POST /webhook response
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub links_affected: u64,
}
