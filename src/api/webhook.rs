//! Inbound sink webhook
//!
//! The sink platform announces registration changes (new links, removals,
//! preference toggles, token rotations) by POSTing signed events here.
//! The payload is authenticated with HMAC-SHA256 over the raw body before
//! anything in it is trusted; see [`crate::push::verify_signature`].

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
    routing::post,
};
use serde::Deserialize;

use super::dto::WebhookResponse;
use crate::AppState;
use crate::error::AppError;
use crate::metrics::WEBHOOK_EVENTS_TOTAL;
use crate::push::verify_signature;

/// Header carrying the hex-encoded payload signature.
pub const SIGNATURE_HEADER: &str = "X-Feedbridge-Signature";

/// Create webhook router
///
/// Routes:
/// - POST /webhook - signed sink event
pub fn webhook_router() -> Router<AppState> {
    Router::new().route("/webhook", post(receive_webhook))
}

/// Events the sink platform delivers.
///
/// `link.created` is also sent when a user re-registers on the sink side,
/// so it always supersedes whatever link the handle had before.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
enum SinkWebhookEvent {
    #[serde(rename = "link.created")]
    LinkCreated {
        sink_id: i64,
        source_handle: String,
        delivery_token: String,
        callback_endpoint: String,
    },
    #[serde(rename = "link.removed")]
    LinkRemoved { sink_id: i64 },
    #[serde(rename = "notifications.enabled")]
    NotificationsEnabled { sink_id: i64 },
    #[serde(rename = "notifications.disabled")]
    NotificationsDisabled { sink_id: i64 },
    #[serde(rename = "token.rotated")]
    TokenRotated {
        sink_id: i64,
        delivery_token: String,
        callback_endpoint: String,
    },
}

impl SinkWebhookEvent {
    fn name(&self) -> &'static str {
        match self {
            SinkWebhookEvent::LinkCreated { .. } => "link.created",
            SinkWebhookEvent::LinkRemoved { .. } => "link.removed",
            SinkWebhookEvent::NotificationsEnabled { .. } => "notifications.enabled",
            SinkWebhookEvent::NotificationsDisabled { .. } => "notifications.disabled",
            SinkWebhookEvent::TokenRotated { .. } => "token.rotated",
        }
    }
}

fn rejected() -> AppError {
    WEBHOOK_EVENTS_TOTAL
        .with_label_values(&["unknown", "rejected"])
        .inc();
    AppError::InvalidSignature
}

/// POST /webhook
///
/// # Steps
/// 1. Verify the payload signature (reject unsigned requests immediately)
/// 2. Parse the event
/// 3. Apply it to the link registry
async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let signature_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(rejected)?;

    let secret = state.config.sink.webhook_secret.as_bytes();
    if !verify_signature(&body, signature_header, secret) {
        return Err(rejected());
    }

    let event: SinkWebhookEvent = serde_json::from_slice(&body).map_err(|e| {
        WEBHOOK_EVENTS_TOTAL
            .with_label_values(&["unknown", "invalid"])
            .inc();
        AppError::Validation(format!("Invalid webhook payload: {}", e))
    })?;

    let name = event.name();
    let links_affected = apply_event(&state, event).await?;

    WEBHOOK_EVENTS_TOTAL
        .with_label_values(&[name, "accepted"])
        .inc();
    tracing::info!(
        event = name,
        links_affected = links_affected,
        "Processed sink webhook"
    );

    Ok(Json(WebhookResponse {
        success: true,
        links_affected,
    }))
}

async fn apply_event(state: &AppState, event: SinkWebhookEvent) -> Result<u64, AppError> {
    match event {
        SinkWebhookEvent::LinkCreated {
            sink_id,
            source_handle,
            delivery_token,
            callback_endpoint,
        } => {
            state
                .registry
                .link_account(
                    &source_handle,
                    sink_id,
                    &delivery_token,
                    &callback_endpoint,
                    true,
                )
                .await?;
            Ok(1)
        }
        SinkWebhookEvent::LinkRemoved { sink_id } => {
            state.registry.remove_sink_links(sink_id).await
        }
        SinkWebhookEvent::NotificationsEnabled { sink_id } => {
            state.registry.set_sink_notifications(sink_id, true).await
        }
        SinkWebhookEvent::NotificationsDisabled { sink_id } => {
            state.registry.set_sink_notifications(sink_id, false).await
        }
        SinkWebhookEvent::TokenRotated {
            sink_id,
            delivery_token,
            callback_endpoint,
        } => {
            state
                .registry
                .rotate_sink_token(sink_id, &delivery_token, &callback_endpoint)
                .await
        }
    }
}
